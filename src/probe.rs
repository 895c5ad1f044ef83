//! Subprocess invocation of the external `probe` tool, and the metadata shapes it returns.
//!
//! The probe contract is two invocations against the same file: one for container/stream
//! metadata, one for the video keyframe timeline (only cheaply available for some
//! containers).

use std::path::Path;
use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use crate::error::{PlayError, Result};

/// Kind of elementary stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
    Subtitle,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamTags {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

/// One elementary stream, as reported by probe's `-show_streams`.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamInfo {
    pub index: usize,
    #[serde(rename = "codec_type")]
    pub kind: StreamKind,
    #[serde(default)]
    pub codec_name: String,
    #[serde(default)]
    pub codec_tag_string: String,
    #[serde(default)]
    pub pix_fmt: Option<String>,
    #[serde(default)]
    pub color_transfer: Option<String>,
    #[serde(default)]
    pub color_primaries: Option<String>,
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub level: Option<i32>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub r_frame_rate: Option<String>,
    #[serde(default, deserialize_with = "de_opt_u64_from_str")]
    pub bit_rate: Option<u64>,
    #[serde(default)]
    pub sample_rate: Option<String>,
    #[serde(default)]
    pub channels: Option<u32>,
    #[serde(default)]
    pub disposition: Disposition,
    #[serde(default)]
    pub tags: StreamTags,
    /// Dolby Vision side-data entries, when present (profile/bl_signal_compatibility_id etc).
    #[serde(default)]
    pub side_data_list: Vec<SideData>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Disposition {
    #[serde(default)]
    pub default: u32,
    #[serde(default)]
    pub forced: u32,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SideData {
    #[serde(default, rename = "side_data_type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub dv_profile: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FormatInfo {
    pub filename: String,
    #[serde(default)]
    pub format_name: String,
    #[serde(default, deserialize_with = "de_opt_f64_from_str")]
    pub duration: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_u64_from_str")]
    pub bit_rate: Option<u64>,
}

/// Full container + stream metadata for one source variant.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceMetadata {
    pub format: FormatInfo,
    pub streams: Vec<StreamInfo>,
    /// Keyframe timestamps in seconds, ascending from zero. Absent when the container does
    /// not cheaply expose them (anything that isn't Matroska, in practice).
    #[serde(skip)]
    pub keyframes: Option<Vec<f64>>,
}

impl SourceMetadata {
    pub fn duration_secs(&self) -> f64 {
        self.format.duration.unwrap_or(0.0)
    }

    pub fn video_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.kind == StreamKind::Video)
    }

    pub fn audio_streams(&self) -> impl Iterator<Item = &StreamInfo> {
        self.streams.iter().filter(|s| s.kind == StreamKind::Audio)
    }

    pub fn primary_video_stream(&self) -> Result<&StreamInfo> {
        self.video_streams().next().ok_or(PlayError::NoVideoStream)
    }
}

fn de_opt_u64_from_str<'de, D>(de: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    Ok(raw.and_then(|s| s.parse::<u64>().ok()))
}

fn de_opt_f64_from_str<'de, D>(de: D) -> std::result::Result<Option<f64>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(de)?;
    Ok(raw.and_then(|s| s.parse::<f64>().ok()))
}

#[derive(Debug, Deserialize)]
struct KeyframePacket {
    #[serde(default)]
    pts_time: Option<String>,
    #[serde(default)]
    flags: String,
}

#[derive(Debug, Deserialize)]
struct KeyframesResponse {
    #[serde(default)]
    packets: Vec<KeyframePacket>,
}

/// Probe a file for container/stream metadata and, when available, its keyframe timeline.
pub async fn probe_file(probe_path: &Path, file: &Path) -> Result<SourceMetadata> {
    let output = Command::new(probe_path)
        .args([
            "-show_streams",
            "-show_format",
            "-loglevel",
            "error",
            "-print_format",
            "json",
        ])
        .arg(file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PlayError::ProbeFailure(format!("failed to spawn probe: {e}")))?;

    if !output.status.success() || output.stdout.is_empty() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlayError::ProbeFailure(format!(
            "probe exited with {:?}: {}",
            output.status.code(),
            stderr.trim()
        )));
    }

    let mut metadata: SourceMetadata = serde_json::from_slice(&output.stdout)
        .map_err(|e| PlayError::ProbeFailure(format!("invalid probe JSON: {e}")))?;

    metadata.keyframes = probe_keyframes(probe_path, file).await.ok().flatten();
    Ok(metadata)
}

/// Second probe invocation: list keyframe presentation timestamps for the primary video
/// stream. Returns `Ok(None)` (not an error) for containers that don't expose this cheaply —
/// the caller treats an absent keyframe list as "copy mode unavailable", not a failure.
async fn probe_keyframes(probe_path: &Path, file: &Path) -> Result<Option<Vec<f64>>> {
    let output = Command::new(probe_path)
        .args([
            "-skip_frame",
            "nokey",
            "-show_entries",
            "packet=pts_time,flags",
            "-select_streams",
            "v",
            "-of",
            "json",
        ])
        .arg(file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PlayError::ProbeFailure(format!("failed to spawn probe: {e}")))?;

    if !output.status.success() {
        return Ok(None);
    }

    let parsed: KeyframesResponse = match serde_json::from_slice(&output.stdout) {
        Ok(p) => p,
        Err(_) => return Ok(None),
    };

    let mut keyframes: Vec<f64> = parsed
        .packets
        .into_iter()
        .filter(|p| p.flags.starts_with('K') && p.pts_time.is_some())
        .filter_map(|p| p.pts_time.unwrap().parse::<f64>().ok())
        .collect();

    if keyframes.is_empty() {
        return Ok(None);
    }

    keyframes.sort_by(|a, b| a.partial_cmp(b).unwrap());
    Ok(Some(keyframes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_and_streams() {
        let json = r#"{
            "format": {"filename": "/x/y.mkv", "format_name": "matroska,webm", "duration": "120.5", "bit_rate": "5000000"},
            "streams": [
                {"index": 0, "codec_type": "video", "codec_name": "hevc", "pix_fmt": "yuv420p10le",
                 "color_transfer": "smpte2084", "color_primaries": "bt2020", "width": 3840, "height": 2160,
                 "r_frame_rate": "24000/1001", "bit_rate": "8000000", "disposition": {"default": 1, "forced": 0}},
                {"index": 1, "codec_type": "audio", "codec_name": "eac3", "channels": 6,
                 "tags": {"language": "eng"}, "disposition": {"default": 1, "forced": 0}}
            ]
        }"#;
        let meta: SourceMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.duration_secs(), 120.5);
        assert_eq!(meta.video_streams().count(), 1);
        assert_eq!(meta.audio_streams().count(), 1);
        let v = meta.primary_video_stream().unwrap();
        assert_eq!(v.codec_name, "hevc");
        assert_eq!(v.width, Some(3840));
    }

    #[test]
    fn test_no_video_stream_error() {
        let json = r#"{"format": {"filename": "x"}, "streams": []}"#;
        let meta: SourceMetadata = serde_json::from_str(json).unwrap();
        assert!(matches!(
            meta.primary_video_stream(),
            Err(PlayError::NoVideoStream)
        ));
    }

    #[test]
    fn test_keyframes_response_filters_non_key_packets() {
        let json = r#"{"packets": [
            {"pts_time": "0.000000", "flags": "K_"},
            {"pts_time": "0.040000", "flags": "__"},
            {"pts_time": "6.715000", "flags": "K_"}
        ]}"#;
        let parsed: KeyframesResponse = serde_json::from_str(json).unwrap();
        let keyframes: Vec<f64> = parsed
            .packets
            .into_iter()
            .filter(|p| p.flags.starts_with('K') && p.pts_time.is_some())
            .filter_map(|p| p.pts_time.unwrap().parse::<f64>().ok())
            .collect();
        assert_eq!(keyframes, vec![0.0, 6.715]);
    }
}
