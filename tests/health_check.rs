//! Black-box smoke test: launches the compiled binary against a scratch config and confirms
//! `/health` responds. The crate is a binary-only target (no `lib.rs`, matching the teacher),
//! so this is exercised out-of-process via `CARGO_BIN_EXE_play-server` rather than by calling
//! `http::create_router` directly.

use std::io::Write;
use std::net::TcpListener;
use std::process::{Child, Command};
use std::time::Duration;

struct ChildGuard(Child);

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

#[test]
fn health_check_responds_ok() {
    let port = free_port();
    let scratch = tempfile::tempdir().unwrap();
    let config_path = scratch.path().join("config.toml");

    let config_toml = format!(
        r#"
host = "127.0.0.1"
port = {port}
transcode_root = "{transcode_root}"
debug = true
cors_enabled = true
log_level = "error"

[encoder]
probe_path = "ffprobe"
encoder_path = "ffmpeg"
preset = "veryfast"
loglevel = "warning"
hwaccel_enabled = false
hwaccel_kind = "vaapi"
hwaccel_device = "/dev/dri/renderD128"
hwaccel_low_power = false
tonemap_enabled = true

[session]
session_timeout_secs = 10
startup_timeout_secs = 60
startup_timeout_debug_secs = 20
segment_wait_timeout_secs = 10
segment_poll_interval_ms = 100
reseek_window_segments = 7
copy_segment_duration_secs = 6.0
transcode_segment_duration_secs = 3.0

[bitrate]
sys_max_bps = 2000000000
"#,
        port = port,
        transcode_root = scratch.path().join("scratch").display(),
    );
    std::fs::File::create(&config_path)
        .unwrap()
        .write_all(config_toml.as_bytes())
        .unwrap();

    let child = Command::new(env!("CARGO_BIN_EXE_play-server"))
        .arg(&config_path)
        .spawn()
        .expect("failed to launch play-server binary");
    let _guard = ChildGuard(child);

    let url = format!("http://127.0.0.1:{port}/health");
    let client = reqwest::blocking::Client::new();
    let mut last_err = None;
    for _ in 0..50 {
        match client.get(&url).send() {
            Ok(resp) if resp.status().is_success() => {
                let body: serde_json::Value = resp.json().expect("health response not JSON");
                assert_eq!(body["status"], "ok");
                return;
            }
            Ok(resp) => last_err = Some(format!("unexpected status {}", resp.status())),
            Err(e) => last_err = Some(e.to_string()),
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    panic!("server never became healthy: {:?}", last_err);
}
