//! Application state: config, the Session Registry, and the metadata provider, shared across
//! all handlers behind an `Arc`.

use std::sync::Arc;

use crate::config::AppConfig;
use crate::metadata_provider::{FileMetadataProvider, MetadataProvider};
use crate::session::SessionRegistry;

pub struct AppState {
    pub config: AppConfig,
    pub sessions: Arc<SessionRegistry>,
    pub metadata: Arc<dyn MetadataProvider>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Arc<Self> {
        let sessions = SessionRegistry::new(std::time::Duration::from_secs(config.session.session_timeout_secs));
        let metadata = Arc::new(FileMetadataProvider::new(config.encoder.probe_path.clone()));
        Arc::new(Self {
            config,
            sessions,
            metadata,
        })
    }

    /// Signal all sessions to tear down, for graceful shutdown.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_state_creation() {
        let state = AppState::new(AppConfig::default());
        assert_eq!(state.config.port, 8003);
    }
}
