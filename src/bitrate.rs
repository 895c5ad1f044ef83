//! BitratePolicy and per-codec quality ladders.

/// Video codec families the quality ladders and bitrate scale factors key off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Hevc,
    Vp9,
    Av1,
}

impl VideoCodec {
    fn scale_factor(self) -> f64 {
        match self {
            VideoCodec::Hevc | VideoCodec::Vp9 => 0.6,
            VideoCodec::Av1 => 0.5,
            VideoCodec::H264 => 1.0,
        }
    }
}

/// `br ≤ 2 Mb/s → x2.5`, `≤ 3 Mb/s → x2`, else unchanged.
fn lift_low_bitrate(br: u64) -> u64 {
    if br <= 2_000_000 {
        (br as f64 * 2.5) as u64
    } else if br <= 3_000_000 {
        br * 2
    } else {
        br
    }
}

/// Floor the scale factor cannot drop below, by bitrate bucket (keyed off the post-lift
/// bitrate). Above 3 Mb/s no floor applies, so a codec's downscale factor (e.g. hevc's 0.6)
/// survives intact.
fn floor_multiplier(br: u64) -> f64 {
    if br <= 500_000 {
        4.0
    } else if br <= 1_000_000 {
        3.0
    } else if br <= 2_000_000 {
        2.5
    } else if br <= 3_000_000 {
        2.0
    } else {
        0.0
    }
}

/// Compute the output video bitrate per the BitratePolicy: lift low inputs, scale by codec
/// factor with an input-bucket floor, clamp to `br_req` if capped, and finally clamp to
/// `sys_max/2` so `bufsize = 2*bitrate` stays representable.
pub fn compute_video_bitrate(
    br_in: u64,
    br_req: Option<u64>,
    in_codec: VideoCodec,
    out_codec: VideoCodec,
    upscaling: bool,
    sys_max_bps: u64,
) -> u64 {
    let mut br = br_req.unwrap_or(br_in);

    if !upscaling {
        let lifted = lift_low_bitrate(br_in);
        br = if let Some(cap) = br_req {
            lifted.min(cap)
        } else {
            lifted
        };
    }

    let scale = out_codec.scale_factor() / in_codec.scale_factor();
    let floored_scale = scale.max(floor_multiplier(br));
    br = (br as f64 * floored_scale) as u64;

    if let Some(cap) = br_req {
        br = br.min(cap);
    }

    br.min(sys_max_bps / 2)
}

/// libx264 CRF by output width.
pub fn crf_h264(width: u32) -> u32 {
    if width >= 3840 {
        18
    } else if width >= 1920 {
        19
    } else {
        26
    }
}

/// libx265 CRF by output width.
///
/// The source ladder contains `width >= 3840` twice; the second branch is unreachable. This
/// is a documented open question, not silently "fixed" — see DESIGN.md.
pub fn crf_hevc(width: u32) -> u32 {
    if width >= 3840 {
        18
    } else if width >= 3840 {
        20
    } else if width >= 1920 {
        22
    } else {
        31
    }
}

/// libvpx-vp9 CRF by output width.
pub fn crf_vp9(width: u32) -> u32 {
    if width >= 3840 {
        15
    } else if width >= 2560 {
        24
    } else if width >= 1920 {
        31
    } else {
        34
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lift_low_bitrate() {
        assert_eq!(lift_low_bitrate(1_000_000), 2_500_000);
        assert_eq!(lift_low_bitrate(2_500_000), 5_000_000);
        assert_eq!(lift_low_bitrate(4_000_000), 4_000_000);
    }

    #[test]
    fn test_crf_ladders() {
        assert_eq!(crf_h264(3840), 18);
        assert_eq!(crf_h264(1920), 19);
        assert_eq!(crf_h264(1280), 26);
        assert_eq!(crf_hevc(3840), 18); // first (reachable) branch wins
        assert_eq!(crf_hevc(1920), 22);
        assert_eq!(crf_hevc(640), 31);
        assert_eq!(crf_vp9(3840), 15);
        assert_eq!(crf_vp9(2560), 24);
        assert_eq!(crf_vp9(1920), 31);
        assert_eq!(crf_vp9(640), 34);
    }

    #[test]
    fn test_compute_video_bitrate_hevc_scales_down() {
        let br = compute_video_bitrate(8_000_000, None, VideoCodec::H264, VideoCodec::Hevc, false, 2_000_000_000);
        // no lift since br_in > 3M; scale = 0.6/1.0 = 0.6, no floor above 3M -> floored_scale = 0.6
        assert_eq!(br, 4_800_000);
    }

    #[test]
    fn test_compute_video_bitrate_low_input_lifted_and_capped() {
        let br = compute_video_bitrate(1_500_000, Some(3_000_000), VideoCodec::H264, VideoCodec::H264, false, 2_000_000_000);
        // lift 1.5M by x2.5 = 3.75M, capped to req 3M
        assert_eq!(br, 3_000_000);
    }

    #[test]
    fn test_sys_max_clamp() {
        let br = compute_video_bitrate(5_000_000_000, None, VideoCodec::H264, VideoCodec::H264, false, 2_000_000_000);
        assert_eq!(br, 1_000_000_000);
    }
}
