//! HLS Planner: segment plan construction, start-segment/start-time inversion, and
//! main/media playlist rendering.

use crate::playlist::codec;

/// An ordered sequence of per-segment durations whose sum equals the source duration.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentPlan(pub Vec<f64>);

impl SegmentPlan {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn target_duration(&self) -> f64 {
        self.0
            .iter()
            .cloned()
            .fold(0.0_f64, f64::max)
            .ceil()
            .max(1.0)
    }

    /// `start_time_from_segment(i)`: sum of plan durations in `[0, i)`. 0 if `i < 1` or out
    /// of range.
    pub fn start_time_from_segment(&self, i: i64) -> f64 {
        if i < 1 {
            return 0.0;
        }
        let end = (i as usize).min(self.0.len());
        self.0[..end].iter().sum()
    }

    /// `start_segment_from_start_time(t)`: linear scan accumulating durations, returning the
    /// index whose cumulative end first exceeds `t`. 0 if `t <= 0`.
    pub fn start_segment_from_start_time(&self, t: f64) -> usize {
        if t <= 0.0 {
            return 0;
        }
        let mut acc = 0.0;
        for (i, dur) in self.0.iter().enumerate() {
            acc += dur;
            if acc > t {
                return i;
            }
        }
        self.0.len().saturating_sub(1)
    }
}

/// Build the copy-mode segment plan: walk the keyframe list, emitting a segment whenever the
/// next keyframe reaches the running break time (nominally every `target_duration` seconds),
/// so segment boundaries land exactly on keyframes.
pub fn plan_copy_mode(keyframes: &[f64], source_duration: f64, target_duration: f64) -> SegmentPlan {
    let mut segments = Vec::new();
    let mut prev_keyframe = 0.0_f64;
    let mut break_time = target_duration;

    for &kf in keyframes {
        if kf >= break_time {
            segments.push(kf - prev_keyframe);
            prev_keyframe = kf;
            break_time += target_duration;
        }
    }
    let remainder = source_duration - prev_keyframe;
    if remainder > 0.0 {
        segments.push(remainder);
    }
    SegmentPlan(segments)
}

/// Build the transcode-mode segment plan: `floor(duration/target)` segments of `target`
/// length, plus a remainder segment (omitted when it would be zero).
pub fn plan_transcode_mode(source_duration: f64, target_duration: f64) -> SegmentPlan {
    let whole = (source_duration / target_duration).floor() as usize;
    let mut segments = vec![target_duration; whole];
    let remainder = source_duration - (whole as f64) * target_duration;
    if remainder > 1e-9 {
        segments.push(remainder);
    }
    SegmentPlan(segments)
}

/// `closest_keyframe_time(t)`: the greatest keyframe ≤ t, or t itself if no keyframes exist.
pub fn closest_keyframe_time(keyframes: Option<&[f64]>, t: f64) -> f64 {
    let Some(keyframes) = keyframes else { return t };
    keyframes
        .iter()
        .rev()
        .find(|&&kf| kf <= t)
        .copied()
        .unwrap_or(t)
}

/// Parameters needed to render the main (master) playlist's single variant line.
pub struct MainPlaylistParams<'a> {
    pub video_bitrate: u64,
    pub audio_bitrate: u64,
    pub video_range: &'a str,
    pub codecs: Option<String>,
    pub variant_url: &'a str,
}

pub fn render_main_playlist(params: &MainPlaylistParams) -> String {
    let bandwidth = codec::calculate_bandwidth(params.video_bitrate, params.audio_bitrate);
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:7\n");
    out.push_str(&format!(
        "#EXT-X-STREAM-INF:BANDWIDTH={bandwidth},AVERAGE-BANDWIDTH={bandwidth},VIDEO-RANGE={}",
        params.video_range
    ));
    if let Some(codecs) = &params.codecs {
        out.push_str(&format!(",CODECS=\"{codecs}\""));
    }
    out.push('\n');
    out.push_str(params.variant_url);
    out.push('\n');
    out
}

/// Render the media (variant) playlist from a segment plan and the query-string params that
/// every segment/init URL must preserve.
pub fn render_media_playlist(plan: &SegmentPlan, url_params: &str) -> String {
    let mut out = String::new();
    out.push_str("#EXTM3U\n");
    out.push_str("#EXT-X-VERSION:7\n");
    out.push_str("#EXT-X-PLAYLIST-TYPE:VOD\n");
    out.push_str(&format!(
        "#EXT-X-TARGETDURATION:{}\n",
        if plan.is_empty() {
            1
        } else {
            plan.target_duration() as u64
        }
    ));
    out.push_str("#EXT-X-MEDIA-SEQUENCE:0\n");
    out.push_str(&format!("#EXT-X-MAP:URI=\"/hls/init.mp4?{url_params}\"\n"));
    for (i, duration) in plan.0.iter().enumerate() {
        out.push_str(&format!("#EXTINF:{duration},\n"));
        out.push_str(&format!("/hls/media{i}.m4s?{url_params}\n"));
    }
    out.push_str("#EXT-X-ENDLIST\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_mode_plan_sums_to_duration() {
        let keyframes = vec![0.0, 6.715, 10.761, 14.473, 18.2, 96.221];
        let duration = 3486.59;
        let plan = plan_copy_mode(&keyframes, duration, 6.0);
        let sum: f64 = plan.0.iter().sum();
        assert!((sum - duration).abs() < 1e-6);
        assert!((plan.0[0] - 6.715).abs() < 1e-9);
        assert!((plan.0[1] - (10.761 - 6.715)).abs() < 1e-9);
        assert!((plan.0[2] - (14.473 - 10.761)).abs() < 1e-9);
    }

    #[test]
    fn test_segment_time_inverse_roundtrip() {
        // Segment boundaries land on keyframes that have reached the running break time, so
        // 10.761 (< break_time 12.0) is absorbed into the next segment rather than starting
        // one of its own: plan = [6.715, 7.758, 3.727, ...].
        let keyframes = vec![0.0, 6.715, 10.761, 14.473, 18.2];
        let plan = plan_copy_mode(&keyframes, 3486.59, 6.0);
        assert!((plan.start_time_from_segment(3) - 18.2).abs() < 1e-6);
        assert_eq!(plan.start_segment_from_start_time(15.0), 2);
    }

    #[test]
    fn test_transcode_mode_plan() {
        let plan = plan_transcode_mode(10.0, 3.0);
        assert_eq!(plan.0, vec![3.0, 3.0, 3.0, 1.0]);
        let plan_exact = plan_transcode_mode(9.0, 3.0);
        assert_eq!(plan_exact.0, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_closest_keyframe_time() {
        let kfs = vec![0.0, 6.715, 10.761];
        assert_eq!(closest_keyframe_time(Some(&kfs), 9.0), 6.715);
        assert_eq!(closest_keyframe_time(None, 9.0), 9.0);
    }

    #[test]
    fn test_empty_plan_target_duration() {
        let plan = SegmentPlan(vec![]);
        let playlist = render_media_playlist(&plan, "session=abc");
        assert!(playlist.contains("#EXT-X-TARGETDURATION:1"));
    }

    #[test]
    fn test_media_playlist_header_nonempty() {
        let plan = SegmentPlan(vec![6.715, 4.046, 3.712]);
        let playlist = render_media_playlist(&plan, "session=abc");
        assert!(playlist.contains("#EXT-X-TARGETDURATION:7"));
        assert!(playlist.contains("/hls/media0.m4s?session=abc"));
        assert!(playlist.ends_with("#EXT-X-ENDLIST\n"));
    }
}
