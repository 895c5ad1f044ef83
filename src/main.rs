//! Play server
//!
//! A per-host media play server: negotiates client playback capabilities against probed
//! source metadata, and serves HLS fMP4/CMAF segments either copied straight from the source
//! or produced by an on-demand transcode session.

mod bitrate;
mod config;
mod encoder;
mod error;
mod hls_planner;
mod http;
mod metadata_provider;
mod negotiator;
mod playlist;
mod probe;
mod range;
mod session;
mod state;
mod transcode_session;

use std::net::SocketAddr;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::AppConfig;
use crate::error::Result;
use crate::http::create_router;
use crate::state::AppState;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        match AppConfig::from_file(std::path::Path::new(&config_path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("failed to load config file {config_path}: {e}. Using defaults.");
                AppConfig::default()
            }
        }
    } else {
        AppConfig::default()
    };

    init_logging(&config.log_level);

    tracing::info!("{} v{} starting", APP_NAME, VERSION);
    check_tool(&config.encoder.probe_path, "probe");
    check_tool(&config.encoder.encoder_path, "encoder");

    std::fs::create_dir_all(&config.transcode_root)?;

    let state = AppState::new(config.clone());
    let app = create_router(state.clone());

    let addr: SocketAddr = config
        .socket_addr()
        .parse()
        .map_err(|e| error::PlayError::Config(format!("invalid host/port: {e}")))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state.clone()))
        .await?;

    Ok(())
}

/// Warn (but do not fail startup) if the configured probe/encoder binary isn't on `PATH` and
/// isn't an absolute path that exists. The first real request will surface a proper
/// `EncoderLaunchFailure` if it's genuinely missing.
fn check_tool(path: &std::path::Path, role: &str) {
    let looks_resolvable = path.is_absolute() || path.components().count() == 1;
    if !looks_resolvable {
        tracing::warn!(role, path = %path.display(), "configured path looks unusual, verify it resolves");
    }
}

async fn shutdown_signal(state: std::sync::Arc<AppState>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, closing sessions");
    state.shutdown().await;
}

fn init_logging(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("play_server={log_level},tower_http=info").into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
