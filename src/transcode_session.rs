//! Orchestrates one encoder launch: resolves the segment plan and encode parameters from a
//! negotiation decision, spawns the encoder, registers the session, and waits for readiness.
//!
//! This is the Rust shape of `start_transcode`/`Transcode.start` from the original service:
//! negotiate once, derive the plan, invert start_segment/start_time against it, then launch.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::bitrate::{self, VideoCodec};
use crate::config::AppConfig;
use crate::encoder::{self, EncodeParams};
use crate::error::{PlayError, Result};
use crate::hls_planner;
use crate::negotiator::{negotiate, video_codec_enum, CapabilityDescriptor, VideoColor};
use crate::negotiator::NegotiationDecision;
use crate::probe::SourceMetadata;
use crate::session::{SessionHandle, SessionRegistry};

fn parse_frame_rate(raw: Option<&str>) -> f64 {
    let Some(raw) = raw else { return 24.0 };
    match raw.split_once('/') {
        Some((num, den)) => {
            let (n, d) = (num.parse::<f64>().unwrap_or(24.0), den.parse::<f64>().unwrap_or(1.0));
            if d == 0.0 {
                24.0
            } else {
                n / d
            }
        }
        None => raw.parse().unwrap_or(24.0),
    }
}

/// Derived encode parameters that both the encoder launch path and the main playlist's
/// bandwidth line need: video/audio bitrate, CRF, fps, and the output channel count.
pub struct ResolvedEncodeInputs {
    pub fps: f64,
    pub source_width: u32,
    pub video_bitrate: u64,
    pub crf: u32,
    pub output_channels: u32,
    pub audio_bitrate: u64,
}

/// Resolve the bitrate/CRF/fps/channel inputs shared by the argv builder and playlist
/// rendering, from a negotiation decision and the capability descriptor that produced it.
pub fn resolve_encode_inputs(
    cfg: &AppConfig,
    metadata: &SourceMetadata,
    caps: &CapabilityDescriptor,
    decision: &NegotiationDecision,
) -> Result<ResolvedEncodeInputs> {
    let video = metadata.primary_video_stream()?;
    let audio_stream = metadata
        .streams
        .iter()
        .find(|s| s.index == decision.audio.absolute_index)
        .ok_or(PlayError::NoVideoStream)?;

    let fps = parse_frame_rate(video.r_frame_rate.as_deref());
    let source_width = video.width.unwrap_or(0);
    let upscaling = decision.target_width > source_width;
    let source_bitrate = video.bit_rate.or(metadata.format.bit_rate).unwrap_or(0);
    let video_bitrate = bitrate::compute_video_bitrate(
        source_bitrate,
        caps.max_video_bitrate,
        video_codec_enum(&video.codec_name),
        video_codec_enum(&decision.output_video_codec),
        upscaling,
        cfg.bitrate.sys_max_bps,
    );
    let crf = match decision.output_video_codec.as_str() {
        "hevc" => bitrate::crf_hevc(decision.target_width),
        "vp9" => bitrate::crf_vp9(decision.target_width),
        _ => bitrate::crf_h264(decision.target_width),
    };

    let source_channels = audio_stream.channels.unwrap_or(2);
    let output_channels = caps
        .max_audio_channels
        .map(|cap| source_channels.min(cap))
        .unwrap_or(source_channels);
    let audio_bitrate = if output_channels < source_channels {
        output_channels as u64 * 128_000
    } else {
        audio_stream.bit_rate.unwrap_or(output_channels as u64 * 128_000)
    };

    Ok(ResolvedEncodeInputs {
        fps,
        source_width,
        video_bitrate,
        crf,
        output_channels,
        audio_bitrate,
    })
}

/// Negotiate, plan, and launch an encoder for a source, positioned at the given start segment
/// or start time (exactly one of which should be set; segment takes precedence).
pub async fn start_session(
    cfg: &AppConfig,
    registry: &Arc<SessionRegistry>,
    session_id: &str,
    source_path: &Path,
    metadata: &SourceMetadata,
    caps: &CapabilityDescriptor,
    format_is_hls: bool,
    start_segment_req: Option<u32>,
    start_time_req: Option<f64>,
) -> Result<Arc<SessionHandle>> {
    let decision = negotiate(metadata, caps, format_is_hls, cfg.encoder.tonemap_enabled)
        .ok_or(PlayError::NoVideoStream)?;

    let target_duration = if decision.can_copy_video {
        cfg.session.copy_segment_duration_secs
    } else {
        cfg.session.transcode_segment_duration_secs
    };

    let plan = if decision.can_copy_video {
        let keyframes = metadata.keyframes.as_deref().unwrap_or(&[]);
        hls_planner::plan_copy_mode(keyframes, metadata.duration_secs(), target_duration)
    } else {
        hls_planner::plan_transcode_mode(metadata.duration_secs(), target_duration)
    };

    let start_segment = match start_segment_req {
        Some(s) => (s as usize).min(plan.len().saturating_sub(1)) as u32,
        None => plan.start_segment_from_start_time(start_time_req.unwrap_or(0.0)) as u32,
    };
    let start_time = plan.start_time_from_segment(start_segment as i64);

    let scratch_dir = cfg.transcode_root.join(session_id);
    tokio::fs::create_dir_all(&scratch_dir).await?;

    let inputs = resolve_encode_inputs(cfg, metadata, caps, &decision)?;
    let ResolvedEncodeInputs {
        fps,
        source_width,
        video_bitrate,
        crf,
        output_channels,
        audio_bitrate,
    } = inputs;

    let tonemap = decision.tonemap && decision.video_color != VideoColor::Dovi;
    let dovi_tonemap = decision.tonemap && decision.video_color == VideoColor::Dovi;
    let dolby_vision_output = decision.video_color == VideoColor::Dovi;

    let params = EncodeParams {
        source_path,
        scratch_dir: &scratch_dir,
        start_time,
        start_segment,
        segment_time: target_duration,
        copying_video: decision.can_copy_video,
        output_video_codec: &decision.output_video_codec,
        dolby_vision_output,
        fps,
        target_width: decision.target_width,
        source_width,
        output_pix_fmt: &decision.output_pix_fmt,
        tonemap,
        dovi_tonemap,
        crf,
        video_bitrate,
        audio_absolute_index: decision.audio.absolute_index,
        copying_audio: decision.can_copy_audio,
        output_audio_codec: &decision.output_audio_codec,
        audio_channels: output_channels,
        max_audio_channels: caps.max_audio_channels,
        audio_bitrate,
    };
    let args = encoder::build_args(cfg, &params);
    let child = encoder::spawn(cfg, session_id, &scratch_dir, &args)?;

    let handle = registry.register(
        session_id.to_string(),
        scratch_dir,
        plan,
        start_segment,
        target_duration,
        child,
    );

    wait_for_media(&handle, cfg.startup_timeout_secs()).await?;
    Ok(handle)
}

/// Poll until the encoder has produced at least one segment, or the startup timeout elapses.
async fn wait_for_media(handle: &SessionHandle, timeout_secs: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        if handle.first_last_transcoded_segment().await.is_some() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PlayError::EncoderStartTimeout(timeout_secs));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Poll until segment `n` is within the produced range, or the per-segment wait timeout
/// elapses.
pub async fn wait_for_segment(handle: &SessionHandle, n: u32, timeout_secs: u64, poll_ms: u64) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
    loop {
        if let Some((first, last)) = handle.first_last_transcoded_segment().await {
            if n >= first && n <= last {
                return Ok(());
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(PlayError::SegmentWaitTimeout(n));
        }
        tokio::time::sleep(Duration::from_millis(poll_ms)).await;
    }
}

/// Decide, given a session's produced range, whether a requested segment should be served,
/// waited for, or requires a restart at that position.
pub enum SegmentAction {
    Ready,
    Wait,
    Restart,
}

pub fn decide_segment_action(produced: Option<(u32, u32)>, requested: u32, reseek_window: u32) -> SegmentAction {
    match produced {
        Some((first, last)) if requested >= first && requested <= last => SegmentAction::Ready,
        Some((first, last)) if requested > last && requested <= last + reseek_window => SegmentAction::Wait,
        Some((first, _)) if requested < first => SegmentAction::Restart,
        Some(_) => SegmentAction::Restart,
        None => SegmentAction::Wait,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frame_rate() {
        assert!((parse_frame_rate(Some("24000/1001")) - 23.976).abs() < 1e-2);
        assert_eq!(parse_frame_rate(Some("25")), 25.0);
        assert_eq!(parse_frame_rate(None), 24.0);
    }

    #[test]
    fn test_decide_segment_action_ready_wait_restart() {
        assert!(matches!(decide_segment_action(Some((0, 10)), 7, 7), SegmentAction::Ready));
        assert!(matches!(decide_segment_action(Some((0, 10)), 12, 7), SegmentAction::Wait));
        assert!(matches!(decide_segment_action(Some((0, 10)), 18, 7), SegmentAction::Restart));
        assert!(matches!(decide_segment_action(Some((8, 10)), 4, 7), SegmentAction::Restart));
        assert!(matches!(decide_segment_action(None, 0, 7), SegmentAction::Wait));
    }
}
