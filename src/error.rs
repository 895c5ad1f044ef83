use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Main error type, mapped onto the error design's HTTP surface table.
#[derive(Error, Debug)]
pub enum PlayError {
    #[error("invalid play id: {0}")]
    InvalidPlayId(String),

    #[error("unknown session: {0}")]
    UnknownSession(String),

    #[error("no metadata: {0}")]
    NoMetadata(String),

    #[error("no video stream found in source file")]
    NoVideoStream,

    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    #[error("encoder did not become ready within {0}s")]
    EncoderStartTimeout(u64),

    #[error("failed to launch or terminate encoder: {0}")]
    EncoderLaunchFailure(String),

    #[error("timed out waiting for segment {0}")]
    SegmentWaitTimeout(u32),

    #[error("probe failed: {0}")]
    ProbeFailure(String),

    #[error("playlist error: {0}")]
    Playlist(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for convenience.
pub type Result<T> = std::result::Result<T, PlayError>;

impl PlayError {
    /// Default HTTP status per the error design table. `EncoderStartTimeout` is 500 when it
    /// blocks playlist start; handlers on the segment path downgrade it to 404 themselves
    /// rather than relying on this default, since the same variant surfaces both ways.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PlayError::InvalidPlayId(_) => StatusCode::BAD_REQUEST,
            PlayError::UnknownSession(_) => StatusCode::NOT_FOUND,
            PlayError::NoMetadata(_) => StatusCode::NOT_FOUND,
            PlayError::NoVideoStream => StatusCode::INTERNAL_SERVER_ERROR,
            PlayError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            PlayError::EncoderStartTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PlayError::EncoderLaunchFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PlayError::SegmentWaitTimeout(_) => StatusCode::NOT_FOUND,
            PlayError::ProbeFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PlayError::Playlist(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PlayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            PlayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PlayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request failed");
        }
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}
