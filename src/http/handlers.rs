//! HTTP request handlers implementing the play server's wire surface.

use std::sync::Arc;

use axum::extract::{OriginalUri, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::error::{PlayError, Result};
use crate::metadata_provider::PlayId;
use crate::negotiator::{negotiate, CapabilityDescriptor};
use crate::playlist::codec;
use crate::probe::SourceMetadata;
use crate::range;
use crate::state::AppState;
use crate::transcode_session::{self, resolve_encode_inputs, SegmentAction};

pub async fn health_check() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Common query parameters carried on every `/hls/*` and `/request-media` request, beyond the
/// Capability Descriptor itself.
struct CommonParams {
    play_id: String,
    session: Option<String>,
    source_index: usize,
    format: String,
    start_time: Option<f64>,
    start_segment: Option<u32>,
}

fn get_one<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn collect_list(pairs: &[(String, String)], key: &str) -> Vec<String> {
    pairs
        .iter()
        .filter(|(k, _)| k == key)
        .flat_map(|(_, v)| v.split(','))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_bool(pairs: &[(String, String)], key: &str) -> bool {
    get_one(pairs, key)
        .map(|v| matches!(v, "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn parse_request(pairs: &[(String, String)]) -> Result<(CommonParams, CapabilityDescriptor)> {
    let play_id = get_one(pairs, "play_id")
        .ok_or_else(|| PlayError::InvalidPlayId("missing play_id".to_string()))?
        .to_string();

    let common = CommonParams {
        play_id,
        session: get_one(pairs, "session").map(str::to_string),
        source_index: get_one(pairs, "source_index").and_then(|v| v.parse().ok()).unwrap_or(0),
        format: get_one(pairs, "format").unwrap_or("hls").to_string(),
        start_time: get_one(pairs, "start_time").and_then(|v| v.parse().ok()),
        start_segment: get_one(pairs, "start_segment").and_then(|v| v.parse().ok()),
    };

    let caps = CapabilityDescriptor {
        supported_video_codecs: collect_list(pairs, "supported_video_codecs"),
        supported_audio_codecs: collect_list(pairs, "supported_audio_codecs"),
        supported_video_containers: collect_list(pairs, "supported_video_containers"),
        supported_hdr_formats: collect_list(pairs, "supported_hdr_formats"),
        supported_video_color_bit_depth: get_one(pairs, "supported_video_color_bit_depth")
            .and_then(|v| v.parse().ok())
            .unwrap_or(8),
        max_width: get_one(pairs, "max_width").and_then(|v| v.parse().ok()),
        max_video_bitrate: get_one(pairs, "max_video_bitrate").and_then(|v| v.parse().ok()),
        max_audio_channels: get_one(pairs, "max_audio_channels").and_then(|v| v.parse().ok()),
        audio_lang: get_one(pairs, "audio_lang").map(str::to_string),
        client_can_switch_audio_track: parse_bool(pairs, "client_can_switch_audio_track"),
        force_transcode: parse_bool(pairs, "force_transcode"),
        transcode_video_codec: get_one(pairs, "transcode_video_codec").unwrap_or("h264").to_string(),
        transcode_audio_codec: get_one(pairs, "transcode_audio_codec").unwrap_or("aac").to_string(),
    };

    Ok((common, caps))
}

fn format_is_hls(format: &str) -> bool {
    format == "hls" || format == "hls.js"
}

async fn load_metadata(state: &AppState, play_id: &str, source_index: usize) -> Result<(std::path::PathBuf, SourceMetadata)> {
    let id = PlayId(play_id.to_string());
    let paths = state.metadata.source_paths(&id).await?;
    let path = paths
        .get(source_index)
        .ok_or_else(|| PlayError::NoMetadata(format!("source index {source_index} out of range")))?
        .clone();
    let metadata = state.metadata.probe_path(&path).await?;
    Ok((path, metadata))
}

pub async fn list_sources(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let Some(play_id) = get_one(&pairs, "play_id") else {
        return PlayError::InvalidPlayId("missing play_id".to_string()).into_response();
    };
    let id = PlayId(play_id.to_string());
    let paths = match state.metadata.source_paths(&id).await {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };

    let mut sources = Vec::new();
    for (i, path) in paths.iter().enumerate() {
        let metadata = match state.metadata.probe_path(path).await {
            Ok(m) => m,
            Err(_) => continue,
        };
        let video = metadata.video_streams().next();
        let audio: Vec<_> = metadata
            .audio_streams()
            .map(|a| {
                json!({
                    "index": a.index,
                    "codec": a.codec_name,
                    "language": a.tags.language,
                    "channels": a.channels,
                })
            })
            .collect();
        sources.push(json!({
            "source_index": i,
            "duration": metadata.duration_secs(),
            "video": video.map(|v| json!({
                "codec": v.codec_name,
                "width": v.width,
                "height": v.height,
                "bit_rate": v.bit_rate,
            })),
            "audio": audio,
        }));
    }
    Json(json!({ "sources": sources })).into_response()
}

pub async fn request_media(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let (common, caps) = match parse_request(&pairs) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let (_, metadata) = match load_metadata(&state, &common.play_id, common.source_index).await {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let decision = match negotiate(&metadata, &caps, format_is_hls(&common.format), state.config.encoder.tonemap_enabled) {
        Some(d) => d,
        None => return PlayError::NoVideoStream.into_response(),
    };

    let query = uri.query().unwrap_or("");
    Json(json!({
        "can_direct_play": decision.can_direct_play,
        "direct_play_url": format!("/source?{query}"),
        "hls_url": format!("/hls/main.m3u8?{query}"),
    }))
    .into_response()
}

pub async fn source_download(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let Some(play_id) = get_one(&pairs, "play_id") else {
        return PlayError::InvalidPlayId("missing play_id".to_string()).into_response();
    };
    let source_index = get_one(&pairs, "source_index").and_then(|v| v.parse().ok()).unwrap_or(0);
    let id = PlayId(play_id.to_string());
    let paths = match state.metadata.source_paths(&id).await {
        Ok(p) => p,
        Err(e) => return e.into_response(),
    };
    let Some(path) = paths.get(source_index) else {
        return PlayError::NoMetadata(format!("source index {source_index} out of range")).into_response();
    };

    let content_type = mime_guess_simple(path);
    let mut resp = range::serve_file(&method, &headers, path, &content_type).await;
    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        if let Ok(value) = axum::http::HeaderValue::from_str(&format!("attachment; filename=\"{name}\"")) {
            resp.headers_mut().insert(axum::http::header::CONTENT_DISPOSITION, value);
        }
    }
    resp
}

fn mime_guess_simple(path: &std::path::Path) -> String {
    match path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase()) {
        Some(ext) if ext == "mkv" => "video/x-matroska".to_string(),
        Some(ext) if ext == "mp4" || ext == "m4v" => "video/mp4".to_string(),
        Some(ext) if ext == "avi" => "video/x-msvideo".to_string(),
        Some(ext) if ext == "webm" => "video/webm".to_string(),
        _ => "application/octet-stream".to_string(),
    }
}

pub async fn hls_main_playlist(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let (common, caps) = match parse_request(&pairs) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let (_, metadata) = match load_metadata(&state, &common.play_id, common.source_index).await {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let decision = match negotiate(&metadata, &caps, format_is_hls(&common.format), state.config.encoder.tonemap_enabled) {
        Some(d) => d,
        None => return PlayError::NoVideoStream.into_response(),
    };
    let inputs = match resolve_encode_inputs(&state.config, &metadata, &caps, &decision) {
        Ok(i) => i,
        Err(e) => return e.into_response(),
    };

    let video = metadata.primary_video_stream().ok();
    let video_codec_str = codec::video_codec_string(
        &decision.output_video_codec,
        decision.bit_depth,
        video.and_then(|v| v.profile.as_deref()).and_then(|p| p.parse().ok()),
        video.and_then(|v| v.level),
    );
    let audio_codec_str = codec::audio_codec_string(&decision.output_audio_codec, false);
    let codecs = codec::build_codec_attribute(video_codec_str.as_deref(), audio_codec_str);

    let video_range = if decision.can_copy_video {
        decision.video_color.hls_video_range()
    } else {
        "SDR"
    };

    let query = uri.query().unwrap_or("");
    let params = crate::hls_planner::MainPlaylistParams {
        video_bitrate: inputs.video_bitrate,
        audio_bitrate: inputs.audio_bitrate,
        video_range,
        codecs,
        variant_url: &format!("/hls/media.m3u8?{query}"),
    };
    let body = crate::hls_planner::render_main_playlist(&params);
    playlist_response(body)
}

pub async fn hls_media_playlist(
    State(state): State<Arc<AppState>>,
    Query(pairs): Query<Vec<(String, String)>>,
    OriginalUri(uri): OriginalUri,
) -> Response {
    let (common, caps) = match parse_request(&pairs) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let Some(session_id) = common.session.clone() else {
        return PlayError::InvalidPlayId("missing session".to_string()).into_response();
    };

    let plan = if let Some(handle) = state.sessions.get(&session_id) {
        handle.plan.clone()
    } else {
        let lock = state.sessions.creation_lock(&session_id);
        let _guard = lock.lock().await;
        if let Some(handle) = state.sessions.get(&session_id) {
            handle.plan.clone()
        } else {
            let (path, metadata) = match load_metadata(&state, &common.play_id, common.source_index).await {
                Ok(v) => v,
                Err(e) => return e.into_response(),
            };
            let result = transcode_session::start_session(
                &state.config,
                &state.sessions,
                &session_id,
                &path,
                &metadata,
                &caps,
                format_is_hls(&common.format),
                common.start_segment,
                common.start_time,
            )
            .await;
            match result {
                Ok(handle) => handle.plan.clone(),
                Err(e) => return e.into_response(),
            }
        }
    };

    let query = uri.query().unwrap_or("");
    let body = crate::hls_planner::render_media_playlist(&plan, query);
    playlist_response(body)
}

pub async fn hls_init_segment(State(state): State<Arc<AppState>>, Query(pairs): Query<Vec<(String, String)>>) -> Response {
    let Some(session_id) = get_one(&pairs, "session") else {
        return PlayError::InvalidPlayId("missing session".to_string()).into_response();
    };
    let Some(handle) = state.sessions.get(session_id) else {
        return PlayError::UnknownSession(session_id.to_string()).into_response();
    };
    match tokio::fs::read(handle.init_segment_path()).await {
        Ok(bytes) => ([(axum::http::header::CONTENT_TYPE, "video/mp4")], bytes).into_response(),
        Err(_) => PlayError::NoMetadata("init segment not ready".to_string()).into_response(),
    }
}

/// Matches `media{N}.m4s` from the dynamic `/hls/{filename}` route.
fn parse_segment_filename(filename: &str) -> Option<u32> {
    filename.strip_prefix("media")?.strip_suffix(".m4s")?.parse().ok()
}

pub async fn hls_segment(
    State(state): State<Arc<AppState>>,
    Path(filename): Path<String>,
    Query(pairs): Query<Vec<(String, String)>>,
) -> Response {
    let Some(n) = parse_segment_filename(&filename) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let (common, caps) = match parse_request(&pairs) {
        Ok(v) => v,
        Err(e) => return e.into_response(),
    };
    let Some(session_id) = common.session.clone() else {
        return PlayError::InvalidPlayId("missing session".to_string()).into_response();
    };

    let cfg = &state.config;
    let reseek_window = cfg.session.reseek_window_segments as u32;
    let wait_timeout = cfg.session.segment_wait_timeout_secs;
    let poll_ms = cfg.session.segment_poll_interval_ms;

    let existing = state.sessions.get(&session_id);
    let produced = match &existing {
        Some(handle) => handle.first_last_transcoded_segment().await,
        None => None,
    };

    let action = transcode_session::decide_segment_action(produced, n, reseek_window);

    let needs_restart = matches!(action, SegmentAction::Restart) || existing.is_none();
    let handle = if !needs_restart {
        existing.unwrap()
    } else {
        let lock = state.sessions.creation_lock(&session_id);
        let _guard = lock.lock().await;
        // Re-check under the lock: another request may have already restarted or created
        // this session while we were waiting for it.
        let recheck = state.sessions.get(&session_id);
        let recheck_produced = match &recheck {
            Some(handle) => handle.first_last_transcoded_segment().await,
            None => None,
        };
        let recheck_action = transcode_session::decide_segment_action(recheck_produced, n, reseek_window);
        if !matches!(recheck_action, SegmentAction::Restart) && recheck.is_some() {
            recheck.unwrap()
        } else {
            let (path, metadata) = match load_metadata(&state, &common.play_id, common.source_index).await {
                Ok(v) => v,
                Err(e) => return e.into_response(),
            };
            match transcode_session::start_session(
                cfg,
                &state.sessions,
                &session_id,
                &path,
                &metadata,
                &caps,
                format_is_hls(&common.format),
                Some(n),
                None,
            )
            .await
            {
                Ok(handle) => handle,
                Err(e) => return e.into_response(),
            }
        }
    };

    if let Err(e) = transcode_session::wait_for_segment(&handle, n, wait_timeout, poll_ms).await {
        return e.into_response();
    }

    match tokio::fs::read(handle.segment_path(n)).await {
        Ok(bytes) => ([(axum::http::header::CONTENT_TYPE, "video/iso.segment")], bytes).into_response(),
        Err(_) => PlayError::SegmentWaitTimeout(n).into_response(),
    }
}

pub async fn keep_alive(State(state): State<Arc<AppState>>, Path(session): Path<String>) -> Response {
    match state.sessions.touch(&session) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn close_session(State(state): State<Arc<AppState>>, Path(session): Path<String>) -> Response {
    state.sessions.close(&session).await;
    StatusCode::NO_CONTENT.into_response()
}

fn playlist_response(body: String) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        body,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_segment_filename() {
        assert_eq!(parse_segment_filename("media12.m4s"), Some(12));
        assert_eq!(parse_segment_filename("init.mp4"), None);
        assert_eq!(parse_segment_filename("media.m3u8"), None);
    }

    #[test]
    fn test_collect_list_comma_and_repeated() {
        let pairs = vec![
            ("supported_video_codecs".to_string(), "h264,hevc".to_string()),
            ("supported_video_codecs".to_string(), "vp9".to_string()),
        ];
        let list = collect_list(&pairs, "supported_video_codecs");
        assert_eq!(list, vec!["h264", "hevc", "vp9"]);
    }

    #[test]
    fn test_parse_request_requires_play_id() {
        let pairs: Vec<(String, String)> = vec![];
        assert!(matches!(parse_request(&pairs), Err(PlayError::InvalidPlayId(_))));
    }
}
