// HTTP boundary: JSON endpoints over the Fetcher plus static serving of saved files

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::downloader::utils::content_disposition;
use crate::downloader::{
    FetchError, Fetcher, MediaKind, MediaMetadata, Quality, SavedFile, StorageManager, StreamHandle, ToolManager,
};

#[derive(Clone)]
pub struct AppState {
    pub fetcher: Arc<Fetcher>,
    pub storage: Arc<StorageManager>,
    pub tools: Arc<ToolManager>,
}

pub fn router(state: AppState) -> Router {
    let saved_files = ServeDir::new(state.storage.downloads_dir());

    Router::new()
        .route("/api/video-info", post(video_info))
        .route("/api/download", post(download_video))
        .route("/api/download-audio", post(download_audio))
        .route("/api/download-to-server", post(download_to_server))
        .route("/api/downloads", get(list_downloads))
        .route("/api/downloads/{filename}", delete(delete_download))
        .route("/health", get(health))
        .nest_service("/downloads", saved_files)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Body accepted by every media endpoint
#[derive(Debug, Default, Deserialize)]
pub struct MediaBody {
    pub url: Option<String>,
    /// "highest", "lowest", a format id, an itag number or a label like "720p"
    #[serde(default)]
    pub quality: Option<serde_json::Value>,
}

impl MediaBody {
    fn url(&self) -> &str {
        self.url.as_deref().unwrap_or_default()
    }

    fn quality(&self) -> Option<Quality> {
        self.quality.as_ref().and_then(Quality::from_json)
    }
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error: String,
    message: Option<String>,
}

impl ApiError {
    fn bad_request(error: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: error.into(),
            message: None,
        }
    }

    fn internal(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: error.into(),
            message: Some(message.into()),
        }
    }
}

impl From<FetchError> for ApiError {
    fn from(e: FetchError) -> Self {
        match &e {
            FetchError::InvalidInput(msg) => Self::bad_request(msg.clone()),
            FetchError::AllBackendsFailed(_) => Self::internal("All download methods failed", e.to_string()),
            FetchError::StorageUnavailable(_) => Self::internal("Downloads directory is not writable", e.to_string()),
            FetchError::SaveFailed(_) => Self::internal("Failed to save download", e.to_string()),
            FetchError::NotFound(name) => Self {
                status: StatusCode::NOT_FOUND,
                error: "File not found".to_string(),
                message: Some(name.clone()),
            },
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: "Invalid request body".to_string(),
            message: Some(rejection.body_text()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.error,
            message: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn video_info(
    State(state): State<AppState>,
    payload: Result<Json<MediaBody>, JsonRejection>,
) -> ApiResult<Json<MediaMetadata>> {
    let Json(body) = payload?;
    let metadata = state.fetcher.resolve_metadata(body.url()).await?;
    Ok(Json(metadata))
}

async fn download_video(
    State(state): State<AppState>,
    payload: Result<Json<MediaBody>, JsonRejection>,
) -> ApiResult<Response> {
    download(state, payload?.0, MediaKind::Video).await
}

async fn download_audio(
    State(state): State<AppState>,
    payload: Result<Json<MediaBody>, JsonRejection>,
) -> ApiResult<Response> {
    download(state, payload?.0, MediaKind::Audio).await
}

async fn download(state: AppState, body: MediaBody, kind: MediaKind) -> ApiResult<Response> {
    let handle = state.fetcher.resolve_stream(body.url(), kind, body.quality()).await?;
    Ok(stream_response(handle))
}

/// Headers go out once, with the first bytes already in hand. Failures from
/// here on only truncate the body.
fn stream_response(handle: StreamHandle) -> Response {
    let mut headers = HeaderMap::new();
    let content_type = HeaderValue::from_str(&handle.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);

    match HeaderValue::from_str(&content_disposition(&handle.filename)) {
        Ok(value) => {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        Err(e) => {
            warn!(filename = %handle.filename, error = %e, "unrepresentable filename header");
            headers.insert(header::CONTENT_DISPOSITION, HeaderValue::from_static("attachment"));
        }
    }

    if let Some(len) = handle.content_length {
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    (headers, Body::from_stream(handle.body)).into_response()
}

#[derive(Serialize)]
struct SavedResponse {
    success: bool,
    filename: String,
    path: String,
}

async fn download_to_server(
    State(state): State<AppState>,
    payload: Result<Json<MediaBody>, JsonRejection>,
) -> ApiResult<Json<SavedResponse>> {
    let Json(body) = payload?;
    let saved = state.fetcher.download_to_server(body.url(), body.quality()).await?;
    Ok(Json(SavedResponse {
        success: true,
        filename: saved.filename,
        path: saved.path.display().to_string(),
    }))
}

async fn list_downloads(State(state): State<AppState>) -> ApiResult<Json<Vec<SavedFile>>> {
    Ok(Json(state.storage.list_saved()?))
}

#[derive(Serialize)]
struct DeleteResponse {
    success: bool,
}

async fn delete_download(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> ApiResult<Json<DeleteResponse>> {
    state.storage.delete_saved(&filename).map_err(|e| match e {
        FetchError::InvalidInput(_) => ApiError::from(e),
        other => ApiError::internal("Failed to delete file", other.to_string()),
    })?;
    Ok(Json(DeleteResponse { success: true }))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthReport {
    status: &'static str,
    downloads_dir: String,
    temp_dir: String,
    using_fallback_dir: bool,
    downloads_writable: bool,
    yt_dlp_path: Option<String>,
    timestamp: String,
}

async fn health(State(state): State<AppState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "ok",
        downloads_dir: state.storage.downloads_dir().display().to_string(),
        temp_dir: state.storage.temp_dir().display().to_string(),
        using_fallback_dir: state.storage.using_fallback(),
        downloads_writable: state.storage.is_writable(),
        yt_dlp_path: state.tools.cached().map(|p| p.display().to_string()),
        timestamp: OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
    })
}
