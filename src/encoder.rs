//! Encoder Controller: builds the encoder argument vector and supervises the encoder
//! subprocess.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::config::{AppConfig, HwAccelKind};
use crate::error::{PlayError, Result};

/// Encoders that accept explicit forced-keyframe expressions (software x264/x265 and the
/// VAAPI software-adjacent paths).
const FORCE_KEYFRAME_FAMILY: &[&str] = &["libx264", "libx265", "h264_vaapi", "hevc_vaapi", "av1_vaapi"];

/// Encoders that only honor GOP-size flags for segment alignment.
const GOP_ONLY_FAMILY: &[&str] = &[
    "h264_qsv",
    "h264_nvenc",
    "h264_amf",
    "hevc_qsv",
    "hevc_nvenc",
    "av1_qsv",
    "av1_nvenc",
    "av1_amf",
    "libsvtav1",
];

/// Maps an output codec name to the encoder library name used on the command line.
pub fn codec_to_library(codec: &str, hwaccel: Option<HwAccelKind>) -> String {
    match (codec, hwaccel) {
        ("h264", None) => "libx264".to_string(),
        ("h264", Some(HwAccelKind::Qsv)) => "h264_qsv".to_string(),
        ("h264", Some(HwAccelKind::Vaapi)) => "h264_vaapi".to_string(),
        ("hevc", None) => "libx265".to_string(),
        ("hevc", Some(HwAccelKind::Qsv)) => "hevc_qsv".to_string(),
        ("hevc", Some(HwAccelKind::Vaapi)) => "hevc_vaapi".to_string(),
        ("vp9", _) => "libvpx-vp9".to_string(),
        ("av1", _) => "libsvtav1".to_string(),
        ("aac", _) => "aac".to_string(),
        ("opus", _) => "libopus".to_string(),
        ("ac3", _) => "ac3".to_string(),
        ("eac3", _) => "eac3".to_string(),
        ("flac", _) => "flac".to_string(),
        ("mp3", _) => "libmp3lame".to_string(),
        (other, _) => other.to_string(),
    }
}

/// Render a seek offset at millisecond precision. Encoder seek behavior diverges at higher
/// precision, so this is always truncated to 3 decimal places.
pub fn quantize_ss(seconds: f64) -> String {
    format!("{:.3}", (seconds * 1000.0).round() / 1000.0)
}

/// `-g:v:0`/`-keyint_min:v:0` value: smallest integer GOP covering one segment at `fps`.
pub fn gop_size(segment_time: f64, fps: f64) -> u32 {
    (segment_time * fps).ceil() as u32
}

/// All the resolved per-session parameters the argv builder needs. Fields mirror the
/// Negotiator's decision record plus session-specific positioning.
pub struct EncodeParams<'a> {
    pub source_path: &'a Path,
    pub scratch_dir: &'a Path,
    pub start_time: f64,
    pub start_segment: u32,
    pub segment_time: f64,

    pub copying_video: bool,
    pub output_video_codec: &'a str,
    pub dolby_vision_output: bool,
    pub fps: f64,
    pub target_width: u32,
    pub source_width: u32,
    pub output_pix_fmt: &'a str,
    pub tonemap: bool,
    pub dovi_tonemap: bool,
    pub crf: u32,
    pub video_bitrate: u64,

    pub audio_absolute_index: usize,
    pub copying_audio: bool,
    pub output_audio_codec: &'a str,
    pub audio_channels: u32,
    pub max_audio_channels: Option<u32>,
    pub audio_bitrate: u64,
}

/// Build the full encoder argument vector per the Encoder Controller's 13-step prefix.
pub fn build_args(cfg: &AppConfig, p: &EncodeParams) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let push = |args: &mut Vec<String>, s: &str| args.push(s.to_string());

    // 1
    push(&mut args, "-analyzeduration");
    push(&mut args, "200M");

    // 2
    if p.copying_video {
        push(&mut args, "-fflags");
        push(&mut args, "+genpts");
    }

    // 3
    let hw = if cfg.encoder.hwaccel_enabled && !p.copying_video {
        Some(cfg.encoder.hwaccel_kind)
    } else {
        None
    };
    if let Some(kind) = hw {
        match kind {
            HwAccelKind::Qsv => {
                push(&mut args, "-init_hw_device");
                args.push(format!("vaapi=va:{}", cfg.encoder.hwaccel_device));
                push(&mut args, "-init_hw_device");
                push(&mut args, "qsv=qs@va");
                push(&mut args, "-filter_hw_device");
                push(&mut args, "qs");
                push(&mut args, "-hwaccel");
                push(&mut args, "vaapi");
                push(&mut args, "-hwaccel_output_format");
                push(&mut args, "vaapi");
            }
            HwAccelKind::Vaapi => {
                push(&mut args, "-init_hw_device");
                args.push(format!("vaapi=va:{}", cfg.encoder.hwaccel_device));
                push(&mut args, "-hwaccel");
                push(&mut args, "vaapi");
                push(&mut args, "-hwaccel_output_format");
                push(&mut args, "vaapi");
            }
        }
    }

    // 4
    let mut ss_index = None;
    if p.start_time > 0.0 {
        push(&mut args, "-ss");
        args.push(quantize_ss(p.start_time));
        ss_index = Some(args.len());
    }

    // 5
    push(&mut args, "-i");
    args.push(format!("file:{}", p.source_path.display()));

    // 6
    for flag in [
        "-map_metadata",
        "-1",
        "-map_chapters",
        "-1",
        "-threads",
        "0",
        "-max_delay",
        "5000000",
        "-max_muxing_queue_size",
        "2048",
    ] {
        push(&mut args, flag);
    }

    // 7
    if p.copying_video {
        if let Some(idx) = ss_index {
            args.insert(idx, "-noaccurate_seek".to_string());
        }
        push(&mut args, "-map");
        push(&mut args, "0:v:0");
        push(&mut args, "-c:v");
        push(&mut args, "copy");
        push(&mut args, "-start_at_zero");
        push(&mut args, "-avoid_negative_ts");
        push(&mut args, "disabled");
        push(&mut args, "-copyts");
    } else {
        push(&mut args, "-map");
        push(&mut args, "0:v:0");
        let lib = codec_to_library(p.output_video_codec, hw);
        push(&mut args, "-c:v");
        args.push(lib);
    }

    if p.output_video_codec == "hevc" {
        push(&mut args, "-tag:v");
        if p.dolby_vision_output {
            args.push("dvh1".to_string());
            push(&mut args, "-strict");
            push(&mut args, "2");
        } else {
            args.push("hvc1".to_string());
        }
    }

    // 8
    if !p.copying_video {
        if let Some(filter) = build_video_filter_chain(cfg, p, hw) {
            push(&mut args, "-vf");
            args.push(filter);
        }

        // 9
        let lib = codec_to_library(p.output_video_codec, hw);
        push(&mut args, "-preset");
        args.push(cfg.encoder.preset.clone());
        push_quality_params(&mut args, &lib, p.crf, p.video_bitrate);
    }

    // 10
    push(&mut args, "-map");
    args.push(format!("0:{}", p.audio_absolute_index));
    push(&mut args, "-c:a");
    if p.copying_audio {
        push(&mut args, "copy");
    } else {
        let lib = codec_to_library(p.output_audio_codec, None);
        args.push(lib);
        let channels = p
            .max_audio_channels
            .map(|cap| p.audio_channels.min(cap))
            .unwrap_or(p.audio_channels);
        push(&mut args, "-ac");
        args.push(channels.to_string());
        push(&mut args, "-b:a");
        args.push(p.audio_bitrate.to_string());
    }

    // 11
    if !p.copying_video {
        let lib = codec_to_library(p.output_video_codec, hw);
        append_keyframe_params(&mut args, &lib, p.segment_time, p.fps);
        if lib == "hevc_vaapi" {
            push(&mut args, "-flags:v");
            push(&mut args, "+global_header");
        }
    }

    // 12
    push(&mut args, "-f");
    push(&mut args, "hls");
    push(&mut args, "-hls_playlist_type");
    push(&mut args, "event");
    push(&mut args, "-hls_segment_type");
    push(&mut args, "fmp4");
    push(&mut args, "-hls_time");
    args.push(format!("{}", p.segment_time));
    push(&mut args, "-hls_list_size");
    push(&mut args, "0");
    push(&mut args, "-start_number");
    args.push(p.start_segment.to_string());
    push(&mut args, "-y");
    if p.copying_video {
        push(&mut args, "-bsf:v");
        args.push(match p.output_video_codec {
            "hevc" => "hevc_mp4toannexb".to_string(),
            _ => "h264_mp4toannexb".to_string(),
        });
    }

    // 13
    args.push(format!("{}", p.scratch_dir.join("media.m3u8").display()));

    args
}

fn append_keyframe_params(args: &mut Vec<String>, lib: &str, segment_time: f64, fps: f64) {
    let gop = gop_size(segment_time, fps);
    let force = FORCE_KEYFRAME_FAMILY.contains(&lib);
    let gop_only = GOP_ONLY_FAMILY.contains(&lib);

    if force || !gop_only {
        args.push("-force_key_frames:0".to_string());
        args.push(format!("expr:gte(t,n_forced*{segment_time})"));
        if lib == "libx264" {
            args.push("-sc_threshold:v:0".to_string());
            args.push("0".to_string());
        }
    }
    if gop_only || !force {
        args.push("-g:v:0".to_string());
        args.push(gop.to_string());
        args.push("-keyint_min:v:0".to_string());
        args.push(gop.to_string());
    }
}

fn build_video_filter_chain(cfg: &AppConfig, p: &EncodeParams, hw: Option<HwAccelKind>) -> Option<String> {
    let mut chain = Vec::new();

    let (primaries, transfer, matrix) = if p.tonemap || p.dovi_tonemap {
        ("bt709", "bt709", "bt709")
    } else {
        ("bt2020", "smpte2084", "bt2020nc")
    };
    chain.push(format!(
        "setparams=color_primaries={primaries}:color_trc={transfer}:colorspace={matrix}"
    ));

    match hw {
        Some(HwAccelKind::Vaapi) | Some(HwAccelKind::Qsv) => {
            let func = match hw {
                Some(HwAccelKind::Qsv) => "scale_qsv",
                _ => "scale_vaapi",
            };
            let fmt = if p.output_pix_fmt == "yuv420p10le" {
                "p010le"
            } else {
                "nv12"
            };
            chain.push(format!("{func}=w={}:h=-2:format={fmt}", p.target_width));
            if p.tonemap {
                chain.push("tonemap_vaapi=format=nv12:p=bt709:t=bt709:m=bt709".to_string());
                let extra = if cfg.encoder.hwaccel_low_power { ":extra_hw_frames=16" } else { "" };
                chain.push(format!("procamp_vaapi=b=0:c=1.2{extra}"));
            }
            if p.dovi_tonemap {
                chain.push("hwmap".to_string());
                chain.push("format=nv12".to_string());
                chain.push("tonemap_opencl=tonemap=hable:peak=100:desat=0".to_string());
                chain.push("hwmap=derive_device=opencl:reverse=1".to_string());
            }
            if matches!(hw, Some(HwAccelKind::Qsv)) {
                chain.push("hwmap=derive_device=qsv".to_string());
                chain.push("format=qsv".to_string());
            }
        }
        None => {
            chain.push(format!("scale=width={}:height=-2", p.target_width));
            chain.push(format!("format={}", p.output_pix_fmt));
        }
    }

    if chain.is_empty() {
        None
    } else {
        Some(chain.join(","))
    }
}

fn push_quality_params(args: &mut Vec<String>, lib: &str, crf: u32, bitrate: u64) {
    let maxrate_bufsize = |args: &mut Vec<String>, bitrate: u64| {
        args.push("-maxrate".to_string());
        args.push(bitrate.to_string());
        args.push("-bufsize".to_string());
        args.push((bitrate * 2).to_string());
    };

    match lib {
        "libx264" => {
            args.push("-x264opts".to_string());
            args.push("subme=0:me_range=4:rc_lookahead=10:me=hex:8x8dct=0:partitions=none".to_string());
            args.push("-crf".to_string());
            args.push(crf.to_string());
            maxrate_bufsize(args, bitrate);
        }
        "libx265" => {
            args.push("-tag:v".to_string());
            args.push("hvc1".to_string());
            args.push("-x265-params".to_string());
            args.push("keyint=24:min-keyint=24".to_string());
            args.push("-crf".to_string());
            args.push(crf.to_string());
            maxrate_bufsize(args, bitrate);
        }
        "libvpx-vp9" => {
            args.push("-g".to_string());
            args.push("24".to_string());
            args.push("-crf".to_string());
            args.push(crf.to_string());
            maxrate_bufsize(args, bitrate);
        }
        "h264_qsv" => {
            args.push("-look_ahead".to_string());
            args.push("0".to_string());
            args.push("-b:v".to_string());
            args.push(bitrate.to_string());
            maxrate_bufsize(args, bitrate);
        }
        "hevc_qsv" => {
            args.push("-tag:v".to_string());
            args.push("hvc1".to_string());
            args.push("-b:v".to_string());
            args.push(bitrate.to_string());
            maxrate_bufsize(args, bitrate);
        }
        _ => {
            args.push("-b:v".to_string());
            args.push(bitrate.to_string());
            maxrate_bufsize(args, bitrate);
        }
    }
}

/// Launch the encoder subprocess, detached from the parent's stdio, writing its own FFmpeg
/// report file into the scratch directory.
pub fn spawn(cfg: &AppConfig, session_id: &str, scratch_dir: &Path, args: &[String]) -> Result<Child> {
    let report = scratch_dir.join(format!("ffmpeg_{session_id}_transcode.log"));
    Command::new(&cfg.encoder.encoder_path)
        .args(args)
        .env(
            "FFREPORT",
            format!("file='{}':level={}", report.display(), cfg.encoder.loglevel),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PlayError::EncoderLaunchFailure(format!("failed to spawn encoder: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantize_ss_truncates_to_ms() {
        assert_eq!(quantize_ss(12.3456), "12.346");
        assert_eq!(quantize_ss(0.0), "0.000");
    }

    #[test]
    fn test_gop_size() {
        assert_eq!(gop_size(3.0, 23.976), 72);
        assert_eq!(gop_size(6.0, 25.0), 150);
    }

    #[test]
    fn test_codec_to_library() {
        assert_eq!(codec_to_library("h264", None), "libx264");
        assert_eq!(codec_to_library("hevc", Some(HwAccelKind::Qsv)), "hevc_qsv");
        assert_eq!(codec_to_library("vp9", None), "libvpx-vp9");
    }

    #[test]
    fn test_keyframe_params_force_family_gets_expr_and_sc_threshold() {
        let mut args = Vec::new();
        append_keyframe_params(&mut args, "libx264", 3.0, 24.0);
        assert!(args.contains(&"-force_key_frames:0".to_string()));
        assert!(args.contains(&"-sc_threshold:v:0".to_string()));
        assert!(!args.contains(&"-g:v:0".to_string()));
    }

    #[test]
    fn test_keyframe_params_gop_only_family() {
        let mut args = Vec::new();
        append_keyframe_params(&mut args, "h264_qsv", 3.0, 24.0);
        assert!(args.contains(&"-g:v:0".to_string()));
        assert!(!args.contains(&"-force_key_frames:0".to_string()));
    }

    #[test]
    fn test_build_args_copy_mode_inserts_noaccurate_seek_after_ss() {
        let cfg = AppConfig::default();
        let params = EncodeParams {
            source_path: Path::new("/media/file.mkv"),
            scratch_dir: Path::new("/tmp/scratch"),
            start_time: 5.0,
            start_segment: 2,
            segment_time: 6.0,
            copying_video: true,
            output_video_codec: "h264",
            dolby_vision_output: false,
            fps: 24.0,
            target_width: 1920,
            source_width: 1920,
            output_pix_fmt: "yuv420p",
            tonemap: false,
            dovi_tonemap: false,
            crf: 19,
            video_bitrate: 5_000_000,
            audio_absolute_index: 1,
            copying_audio: true,
            output_audio_codec: "aac",
            audio_channels: 2,
            max_audio_channels: None,
            audio_bitrate: 128_000,
        };
        let args = build_args(&cfg, &params);
        let ss_pos = args.iter().position(|a| a == "-ss").unwrap();
        assert_eq!(args[ss_pos + 2], "-noaccurate_seek");
        assert!(args.contains(&"-bsf:v".to_string()));
    }
}
