//! Axum router configuration.
//!
//! `/files/*`, `/subtitle-file`, and `/thumbnails/*` are external-collaborator endpoints
//! (scratch-tree static serving, subtitle extraction, thumbnail generation) and are not routed
//! here; they belong to a process this crate does not implement.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::state::AppState;

use super::handlers;

pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::HEAD, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::ACCEPT,
            header::RANGE,
            header::CONTENT_TYPE,
            header::ORIGIN,
        ])
        .max_age(Duration::from_secs(3600));

    let mut router = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/sources", get(handlers::list_sources))
        .route("/request-media", get(handlers::request_media))
        .route(
            "/source",
            get(handlers::source_download).head(handlers::source_download),
        )
        .route("/hls/main.m3u8", get(handlers::hls_main_playlist))
        .route("/hls/media.m3u8", get(handlers::hls_media_playlist))
        .route("/hls/init.mp4", get(handlers::hls_init_segment))
        .route("/hls/{filename}", get(handlers::hls_segment))
        .route("/keep-alive/{session}", post(handlers::keep_alive))
        .route("/close-session/{session}", post(handlers::close_session));

    if state.config.cors_enabled {
        router = router.layer(cors);
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_create_router() {
        let state = AppState::new(AppConfig::default());
        let _router = create_router(state);
    }
}
