//! HLS `CODECS` attribute string generation.

/// HLS video codec string for the chosen output video codec.
///
/// HEVC Main10 (10-bit) uses the `.2.4.` profile/tier/level variant; Main (8-bit) uses
/// `.1.4.`. `level` is the FFmpeg-style integer level (e.g. `93` for level 3.1), matched
/// directly into `L{level}`.
pub fn video_codec_string(
    codec: &str,
    bit_depth: u8,
    profile: Option<i32>,
    level: Option<i32>,
) -> Option<String> {
    match codec {
        "h264" => Some(h264_profile_level(profile, level)),
        "hevc" | "h265" => {
            let level = level.unwrap_or(93);
            if bit_depth >= 10 {
                Some(format!("hvc1.2.4.L{level}.B0"))
            } else {
                Some(format!("hvc1.1.4.L{level}.B0"))
            }
        }
        "vp9" => Some("vp09.00.10.08".to_string()),
        "av1" => Some("av01.0.04M.08".to_string()),
        _ => None,
    }
}

fn h264_profile_level(profile: Option<i32>, level: Option<i32>) -> String {
    let profile_byte = match profile {
        Some(66) => 0x42,
        Some(77) => 0x4d,
        Some(100) => 0x64,
        Some(244) => 0xf4,
        _ => 0x64,
    };
    let level_byte = level.unwrap_or(40) as u8;
    format!("avc1.{:02x}00{:02x}", profile_byte, level_byte)
}

/// HLS audio codec string. `is_he_aac` selects AAC's HE variant (`.40.5`) over LC (`.40.2`).
pub fn audio_codec_string(codec: &str, is_he_aac: bool) -> Option<&'static str> {
    match codec {
        "aac" if is_he_aac => Some("mp4a.40.5"),
        "aac" => Some("mp4a.40.2"),
        "ac3" => Some("mp4a.a5"),
        "eac3" => Some("mp4a.a6"),
        "opus" => Some("Opus"),
        "mp3" => Some("mp4a.40.34"),
        "flac" => Some("fLaC"),
        "vorbis" => Some("vorbis"),
        _ => None,
    }
}

/// Build the `CODECS="..."` attribute value from the resolved output codecs.
pub fn build_codec_attribute(video: Option<&str>, audio: Option<&str>) -> Option<String> {
    let mut parts = Vec::new();
    if let Some(v) = video {
        parts.push(v.to_string());
    }
    if let Some(a) = audio {
        parts.push(a.to_string());
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}

/// `BANDWIDTH` estimate: video + audio bitrate, with a margin since encoder-reported
/// average bitrate underestimates the peak segment rate HLS requires as an upper bound.
pub fn calculate_bandwidth(video_bitrate: u64, audio_bitrate: u64) -> u64 {
    (video_bitrate + audio_bitrate) * 160 / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h264_codec_string() {
        assert_eq!(
            video_codec_string("h264", 8, Some(100), Some(40)),
            Some("avc1.640028".to_string())
        );
        assert_eq!(
            video_codec_string("h264", 8, Some(77), Some(31)),
            Some("avc1.4d001f".to_string())
        );
    }

    #[test]
    fn test_hevc_main_vs_main10() {
        assert_eq!(
            video_codec_string("hevc", 8, None, Some(93)),
            Some("hvc1.1.4.L93.B0".to_string())
        );
        assert_eq!(
            video_codec_string("hevc", 10, None, Some(93)),
            Some("hvc1.2.4.L93.B0".to_string())
        );
    }

    #[test]
    fn test_audio_codec_strings() {
        assert_eq!(audio_codec_string("aac", false), Some("mp4a.40.2"));
        assert_eq!(audio_codec_string("aac", true), Some("mp4a.40.5"));
        assert_eq!(audio_codec_string("ac3", false), Some("mp4a.a5"));
        assert_eq!(audio_codec_string("eac3", false), Some("mp4a.a6"));
        assert_eq!(audio_codec_string("opus", false), Some("Opus"));
        assert_eq!(audio_codec_string("flac", false), Some("fLaC"));
        assert_eq!(audio_codec_string("mp3", false), Some("mp4a.40.34"));
    }

    #[test]
    fn test_build_codec_attribute() {
        let attr = build_codec_attribute(Some("avc1.640028"), Some("mp4a.40.2"));
        assert_eq!(attr, Some("avc1.640028,mp4a.40.2".to_string()));
    }

    #[test]
    fn test_bandwidth_adds_margin() {
        assert_eq!(calculate_bandwidth(5_000_000, 128_000), 8_204_800);
    }
}
