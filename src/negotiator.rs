//! Capability Negotiator: decides direct-play / copy-video / copy-audio / transcode and
//! resolves the derived output codec, pixel format, width, bitrate, and tonemap plan.

use crate::bitrate::VideoCodec;
use crate::probe::{SideData, SourceMetadata, StreamInfo, StreamKind};

/// Classified video color space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoColor {
    Sdr,
    Hdr10,
    Hlg,
    Dovi,
}

impl VideoColor {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoColor::Sdr => "sdr",
            VideoColor::Hdr10 => "hdr10",
            VideoColor::Hlg => "hlg",
            VideoColor::Dovi => "dovi",
        }
    }

    pub fn is_hdr(self) -> bool {
        !matches!(self, VideoColor::Sdr)
    }

    /// The `VIDEO-RANGE` attribute value for a main-playlist `STREAM-INF` line.
    pub fn hls_video_range(self) -> &'static str {
        match self {
            VideoColor::Sdr => "SDR",
            VideoColor::Hdr10 | VideoColor::Dovi => "PQ",
            VideoColor::Hlg => "HLG",
        }
    }
}

const DOVI_CODEC_TAGS: &[&str] = &["dovi", "dvh1", "dvhe", "dav1"];

/// Classify a video stream's color space from transfer/primaries/codec tag/side data.
pub fn classify_video_color(stream: &StreamInfo) -> VideoColor {
    let transfer = stream.color_transfer.as_deref().unwrap_or("");
    let primaries = stream.color_primaries.as_deref().unwrap_or("");

    if is_dolby_vision(stream) {
        return VideoColor::Dovi;
    }
    if transfer == "smpte2084" && primaries == "bt2020" {
        return VideoColor::Hdr10;
    }
    if transfer == "arib-std-b67" {
        return VideoColor::Hlg;
    }
    VideoColor::Sdr
}

fn is_dolby_vision(stream: &StreamInfo) -> bool {
    let tag = stream.codec_tag_string.to_lowercase();
    if DOVI_CODEC_TAGS.iter().any(|t| tag == *t) {
        return true;
    }
    stream
        .side_data_list
        .iter()
        .any(|sd: &SideData| sd.kind.as_deref() == Some("DOVI configuration record") && matches!(sd.dv_profile, Some(5) | Some(7) | Some(8)))
}

/// Bit depth implied by a pixel format string.
pub fn classify_bit_depth(pix_fmt: &str) -> u8 {
    if pix_fmt.ends_with("12le") || pix_fmt.ends_with("12be") {
        12
    } else if pix_fmt == "yuv420p10le" || pix_fmt == "yuv444p10le" || pix_fmt.ends_with("10le") {
        10
    } else {
        8
    }
}

/// The Capability Descriptor, as received in the request query string.
#[derive(Debug, Clone, Default)]
pub struct CapabilityDescriptor {
    pub supported_video_codecs: Vec<String>,
    pub supported_audio_codecs: Vec<String>,
    pub supported_video_containers: Vec<String>,
    pub supported_hdr_formats: Vec<String>,
    pub supported_video_color_bit_depth: u8,
    pub max_width: Option<u32>,
    pub max_video_bitrate: Option<u64>,
    pub max_audio_channels: Option<u32>,
    pub audio_lang: Option<String>,
    pub client_can_switch_audio_track: bool,
    pub force_transcode: bool,
    pub transcode_video_codec: String,
    pub transcode_audio_codec: String,
}

/// Resolved audio stream selection: absolute stream index plus its position among audio
/// streams only (the "group index").
#[derive(Debug, Clone, Copy)]
pub struct AudioSelection {
    pub absolute_index: usize,
    pub group_index: usize,
}

/// The Negotiator's full decision record for one source variant.
#[derive(Debug, Clone)]
pub struct NegotiationDecision {
    pub can_direct_play: bool,
    pub can_copy_video: bool,
    pub can_copy_audio: bool,
    pub video_color: VideoColor,
    pub bit_depth: u8,
    pub output_video_codec: String,
    pub output_audio_codec: String,
    pub output_pix_fmt: String,
    pub target_width: u32,
    pub tonemap: bool,
    pub audio: AudioSelection,
}

/// `stream_index_by_lang`: select an audio stream by an optional `lang` or `lang:index`
/// request, falling back to the default-flagged stream, then the first audio stream.
pub fn stream_index_by_lang(metadata: &SourceMetadata, request: Option<&str>) -> Option<AudioSelection> {
    let (lang_part, abs_index) = match request {
        None | Some("") => (None, None),
        Some(r) => match r.split_once(':') {
            Some((lang, idx)) => (Some(lang), idx.parse::<usize>().ok()),
            None => (Some(r), None),
        },
    };

    let audio_streams: Vec<&StreamInfo> = metadata.audio_streams().collect();

    if let Some(idx) = abs_index {
        if let Some((group_index, stream)) = audio_streams
            .iter()
            .enumerate()
            .find(|(_, s)| s.index == idx)
        {
            if matches_lang(stream, lang_part) {
                return Some(AudioSelection {
                    absolute_index: stream.index,
                    group_index,
                });
            }
        }
    }

    if let Some(lang) = lang_part {
        if let Some((group_index, stream)) = audio_streams
            .iter()
            .enumerate()
            .find(|(_, s)| matches_lang(s, Some(lang)))
        {
            return Some(AudioSelection {
                absolute_index: stream.index,
                group_index,
            });
        }
    }

    if lang_part.is_none() {
        if let Some((group_index, stream)) = audio_streams
            .iter()
            .enumerate()
            .find(|(_, s)| s.disposition.default != 0)
        {
            return Some(AudioSelection {
                absolute_index: stream.index,
                group_index,
            });
        }
    }

    audio_streams.first().map(|s| AudioSelection {
        absolute_index: s.index,
        group_index: 0,
    })
}

fn matches_lang(stream: &StreamInfo, lang: Option<&str>) -> bool {
    let Some(lang) = lang else { return true };
    let lang = lang.to_lowercase();
    stream
        .tags
        .language
        .as_deref()
        .map(|l| l.to_lowercase() == lang)
        .unwrap_or(false)
        || stream
            .tags
            .title
            .as_deref()
            .map(|t| t.to_lowercase() == lang)
            .unwrap_or(false)
}

/// Map a probed codec name onto the bitrate-policy codec family used for scale factors.
pub fn video_codec_enum(name: &str) -> VideoCodec {
    match name {
        "hevc" | "h265" => VideoCodec::Hevc,
        "vp9" => VideoCodec::Vp9,
        "av1" => VideoCodec::Av1,
        _ => VideoCodec::H264,
    }
}

/// Run the full negotiation for a single source variant, for the given HTTP-surface format
/// (`"hls"`/`"hls.js"` forces h264 output per the documented player-compat constraint).
pub fn negotiate(
    metadata: &SourceMetadata,
    caps: &CapabilityDescriptor,
    format_is_hls: bool,
    tonemap_config_enabled: bool,
) -> Option<NegotiationDecision> {
    let video = metadata.primary_video_stream().ok()?;
    let video_color = classify_video_color(video);
    let bit_depth = video
        .pix_fmt
        .as_deref()
        .map(classify_bit_depth)
        .unwrap_or(8);
    let source_width = video.width.unwrap_or(0);
    let source_bitrate = video.bit_rate.or(metadata.format.bit_rate).unwrap_or(0);

    let can_copy_video = !caps.force_transcode
        && caps
            .supported_video_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&video.codec_name))
        && bit_depth <= caps.supported_video_color_bit_depth
        && (!(video_color.is_hdr() && tonemap_config_enabled)
            || caps
                .supported_hdr_formats
                .iter()
                .any(|h| h.eq_ignore_ascii_case(video_color.as_str())))
        && caps.max_width.map(|w| w >= source_width).unwrap_or(true)
        && caps
            .max_video_bitrate
            .map(|b| b >= source_bitrate)
            .unwrap_or(true)
        && metadata.keyframes.is_some();

    let can_copy_video_ignoring_keyframes = !caps.force_transcode
        && caps
            .supported_video_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&video.codec_name))
        && bit_depth <= caps.supported_video_color_bit_depth
        && (!(video_color.is_hdr() && tonemap_config_enabled)
            || caps
                .supported_hdr_formats
                .iter()
                .any(|h| h.eq_ignore_ascii_case(video_color.as_str())))
        && caps.max_width.map(|w| w >= source_width).unwrap_or(true)
        && caps
            .max_video_bitrate
            .map(|b| b >= source_bitrate)
            .unwrap_or(true);

    let audio = stream_index_by_lang(metadata, caps.audio_lang.as_deref())?;
    let audio_stream = metadata
        .streams
        .iter()
        .find(|s| s.kind == StreamKind::Audio && s.index == audio.absolute_index)?;

    let can_copy_audio = caps
        .max_audio_channels
        .map(|cap| audio_stream.channels.map(|c| cap >= c).unwrap_or(true))
        .unwrap_or(true)
        && caps
            .supported_audio_codecs
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&audio_stream.codec_name));

    let container_match = metadata
        .format
        .format_name
        .split(',')
        .any(|f| {
            caps.supported_video_containers
                .iter()
                .any(|c| c.eq_ignore_ascii_case(f))
        });

    let default_audio_unique = audio_streams_default_unique(metadata, audio.absolute_index);

    let can_direct_play = can_copy_video_ignoring_keyframes
        && can_copy_audio
        && container_match
        && (default_audio_unique || caps.client_can_switch_audio_track);

    let output_video_codec = if format_is_hls {
        "h264".to_string()
    } else if can_copy_video {
        video.codec_name.clone()
    } else {
        caps.transcode_video_codec.clone()
    };

    let output_audio_codec = if can_copy_audio {
        audio_stream.codec_name.clone()
    } else {
        caps.transcode_audio_codec.clone()
    };

    let target_width = caps.max_width.unwrap_or(source_width).min(source_width.max(1));

    let supports_10bit = caps.supported_video_color_bit_depth >= 10;
    let output_pix_fmt = if supports_10bit && bit_depth >= 10 {
        "yuv420p10le".to_string()
    } else {
        "yuv420p".to_string()
    };

    let target_is_sdr = output_pix_fmt == "yuv420p";
    let tonemap = video_color.is_hdr()
        && target_is_sdr
        && tonemap_config_enabled
        && bit_depth == 10
        && (video_color != VideoColor::Dovi || video.codec_name == "hevc");

    Some(NegotiationDecision {
        can_direct_play,
        can_copy_video,
        can_copy_audio,
        video_color,
        bit_depth,
        output_video_codec,
        output_audio_codec,
        output_pix_fmt,
        target_width,
        tonemap,
        audio,
    })
}

fn audio_streams_default_unique(metadata: &SourceMetadata, absolute_index: usize) -> bool {
    let defaults: Vec<&StreamInfo> = metadata
        .audio_streams()
        .filter(|s| s.disposition.default != 0)
        .collect();
    defaults.len() == 1 && defaults[0].index == absolute_index
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Disposition, FormatInfo, StreamTags};

    fn video_stream(codec: &str, pix_fmt: &str, transfer: &str, primaries: &str) -> StreamInfo {
        StreamInfo {
            index: 0,
            kind: StreamKind::Video,
            codec_name: codec.to_string(),
            codec_tag_string: String::new(),
            pix_fmt: Some(pix_fmt.to_string()),
            color_transfer: Some(transfer.to_string()),
            color_primaries: Some(primaries.to_string()),
            profile: None,
            level: None,
            width: Some(3840),
            height: Some(2160),
            r_frame_rate: Some("24000/1001".to_string()),
            bit_rate: Some(8_000_000),
            sample_rate: None,
            channels: None,
            disposition: Disposition::default(),
            tags: StreamTags::default(),
            side_data_list: vec![],
        }
    }

    fn audio_stream(index: usize, codec: &str, lang: &str, default: u32) -> StreamInfo {
        StreamInfo {
            index,
            kind: StreamKind::Audio,
            codec_name: codec.to_string(),
            codec_tag_string: String::new(),
            pix_fmt: None,
            color_transfer: None,
            color_primaries: None,
            profile: None,
            level: None,
            width: None,
            height: None,
            r_frame_rate: None,
            bit_rate: Some(192_000),
            sample_rate: Some("48000".to_string()),
            channels: Some(2),
            disposition: Disposition { default, forced: 0 },
            tags: StreamTags {
                language: Some(lang.to_string()),
                title: None,
            },
            side_data_list: vec![],
        }
    }

    fn metadata_with(streams: Vec<StreamInfo>, keyframes: Option<Vec<f64>>) -> SourceMetadata {
        SourceMetadata {
            format: FormatInfo {
                filename: "x.mkv".into(),
                format_name: "matroska,webm".into(),
                duration: Some(3486.59),
                bit_rate: Some(8_500_000),
            },
            streams,
            keyframes,
        }
    }

    #[test]
    fn test_classify_video_color_hdr10() {
        let s = video_stream("hevc", "yuv420p10le", "smpte2084", "bt2020");
        assert_eq!(classify_video_color(&s), VideoColor::Hdr10);
        assert_eq!(classify_bit_depth(s.pix_fmt.as_deref().unwrap()), 10);
    }

    #[test]
    fn test_classify_video_color_hlg_and_sdr() {
        let s = video_stream("hevc", "yuv420p10le", "arib-std-b67", "bt2020");
        assert_eq!(classify_video_color(&s), VideoColor::Hlg);
        let s = video_stream("h264", "yuv420p", "bt709", "bt709");
        assert_eq!(classify_video_color(&s), VideoColor::Sdr);
    }

    #[test]
    fn test_stream_index_by_lang_default_and_fallback() {
        let meta = metadata_with(
            vec![
                video_stream("h264", "yuv420p", "bt709", "bt709"),
                audio_stream(1, "aac", "eng", 0),
                audio_stream(2, "eac3", "jpn", 1),
            ],
            Some(vec![0.0]),
        );
        let sel = stream_index_by_lang(&meta, None).unwrap();
        assert_eq!(sel.absolute_index, 2); // default-flagged
        let sel = stream_index_by_lang(&meta, Some("eng")).unwrap();
        assert_eq!(sel.absolute_index, 1);
        let sel = stream_index_by_lang(&meta, Some("fra")).unwrap();
        assert_eq!(sel.absolute_index, 1); // fallback to first audio
    }

    #[test]
    fn test_scenario_hevc10_hdr10_rejected_by_h264_only_client() {
        let meta = metadata_with(
            vec![
                video_stream("hevc", "yuv420p10le", "smpte2084", "bt2020"),
                audio_stream(1, "aac", "eng", 1),
            ],
            Some(vec![0.0, 6.715]),
        );
        let caps = CapabilityDescriptor {
            supported_video_codecs: vec!["h264".to_string()],
            supported_audio_codecs: vec!["aac".to_string()],
            supported_video_containers: vec!["matroska".to_string()],
            supported_hdr_formats: vec![],
            supported_video_color_bit_depth: 10,
            transcode_video_codec: "h264".to_string(),
            transcode_audio_codec: "aac".to_string(),
            ..Default::default()
        };
        let decision = negotiate(&meta, &caps, false, true).unwrap();
        assert!(!decision.can_copy_video);
        assert!(!decision.can_direct_play);
        assert_eq!(decision.output_video_codec, "h264");
        assert!(decision.tonemap);
    }

    #[test]
    fn test_direct_play_requires_copy_video_and_audio() {
        let meta = metadata_with(
            vec![
                video_stream("h264", "yuv420p", "bt709", "bt709"),
                audio_stream(1, "aac", "eng", 1),
            ],
            Some(vec![0.0]),
        );
        let caps = CapabilityDescriptor {
            supported_video_codecs: vec!["h264".to_string()],
            supported_audio_codecs: vec!["aac".to_string()],
            supported_video_containers: vec!["matroska".to_string()],
            supported_video_color_bit_depth: 8,
            transcode_video_codec: "h264".to_string(),
            transcode_audio_codec: "aac".to_string(),
            ..Default::default()
        };
        let decision = negotiate(&meta, &caps, false, true).unwrap();
        assert!(decision.can_copy_video);
        assert!(decision.can_copy_audio);
        assert!(decision.can_direct_play);
    }
}
