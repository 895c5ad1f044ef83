//! Server configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Hardware acceleration backend for the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HwAccelKind {
    Qsv,
    Vaapi,
}

/// External tool and hardware-acceleration configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncoderConfig {
    /// Path to the `probe` binary (ffprobe-compatible).
    pub probe_path: PathBuf,

    /// Path to the `encoder` binary (ffmpeg-compatible).
    pub encoder_path: PathBuf,

    /// `-preset` value passed to the encoder.
    pub preset: String,

    /// Log level passed via `FFREPORT`.
    pub loglevel: String,

    /// Whether hardware-accelerated decode/encode is enabled.
    pub hwaccel_enabled: bool,

    /// Hardware accelerator kind, when enabled.
    pub hwaccel_kind: HwAccelKind,

    /// Device node for VAAPI/QSV (e.g. `/dev/dri/renderD128`).
    pub hwaccel_device: String,

    /// Whether to request the hardware encoder's low-power mode.
    pub hwaccel_low_power: bool,

    /// Whether HDR tonemap filters are applied when downconverting to SDR.
    pub tonemap_enabled: bool,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            probe_path: PathBuf::from("ffprobe"),
            encoder_path: PathBuf::from("ffmpeg"),
            preset: "veryfast".to_string(),
            loglevel: "40".to_string(),
            hwaccel_enabled: false,
            hwaccel_kind: HwAccelKind::Vaapi,
            hwaccel_device: "/dev/dri/renderD128".to_string(),
            hwaccel_low_power: true,
            tonemap_enabled: true,
        }
    }
}

/// Session and transcode timing configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Idle-eviction window, in seconds.
    pub session_timeout_secs: u64,

    /// Startup readiness timeout, in seconds (production).
    pub startup_timeout_secs: u64,

    /// Startup readiness timeout, in seconds (debug builds).
    pub startup_timeout_debug_secs: u64,

    /// Per-segment wait timeout, in seconds.
    pub segment_wait_timeout_secs: u64,

    /// Poll interval while waiting for a segment, in milliseconds.
    pub segment_poll_interval_ms: u64,

    /// How many segments past the last produced one to wait for, before restarting
    /// the encoder at the requested position instead.
    pub reseek_window_segments: u64,

    /// Nominal target segment duration in copy mode, in seconds.
    pub copy_segment_duration_secs: f64,

    /// Nominal target segment duration in transcode mode, in seconds.
    pub transcode_segment_duration_secs: f64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_timeout_secs: 10,
            startup_timeout_secs: 60,
            startup_timeout_debug_secs: 20,
            segment_wait_timeout_secs: 10,
            segment_poll_interval_ms: 100,
            reseek_window_segments: 7,
            copy_segment_duration_secs: 6.0,
            transcode_segment_duration_secs: 3.0,
        }
    }
}

/// Bitrate policy limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BitrateConfig {
    /// Upper clamp for any derived output bitrate, in bits/sec. Kept finite so that
    /// `bufsize = 2 x bitrate` never overflows a signed 32-bit argument downstream.
    pub sys_max_bps: u64,
}

impl Default for BitrateConfig {
    fn default() -> Self {
        Self {
            // Roughly i32::MAX; halved at the point of use per the BitratePolicy clamp.
            sys_max_bps: 2_000_000_000,
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Host address to bind to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// Root directory under which `{session}/` scratch directories are created.
    pub transcode_root: PathBuf,

    /// Whether the process is running in debug mode (affects startup timeout).
    pub debug: bool,

    /// Encoder/probe/hwaccel settings.
    pub encoder: EncoderConfig,

    /// Session and timing settings.
    pub session: SessionConfig,

    /// Bitrate policy settings.
    pub bitrate: BitrateConfig,

    /// Enable permissive CORS for the HTTP surface.
    pub cors_enabled: bool,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8003,
            transcode_root: std::env::temp_dir().join("play_server"),
            debug: false,
            encoder: EncoderConfig::default(),
            session: SessionConfig::default(),
            bitrate: BitrateConfig::default(),
            cors_enabled: true,
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Get the socket address string.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Startup readiness timeout for the current run mode.
    pub fn startup_timeout_secs(&self) -> u64 {
        if self.debug {
            self.session.startup_timeout_debug_secs
        } else {
            self.session.startup_timeout_secs
        }
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &std::path::Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file(&self, path: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8003);
        assert_eq!(config.session.session_timeout_secs, 10);
    }

    #[test]
    fn test_socket_addr() {
        let config = AppConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            ..Default::default()
        };
        assert_eq!(config.socket_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_startup_timeout_debug_vs_prod() {
        let mut config = AppConfig::default();
        assert_eq!(config.startup_timeout_secs(), 60);
        config.debug = true;
        assert_eq!(config.startup_timeout_secs(), 20);
    }
}
