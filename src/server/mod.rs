//! HTTP API exposing downloads, progress streaming, and history.
//!
//! One spawned task per accepted download drives the downloader and writes
//! progress snapshots into the shared [`TaskRegistry`]; SSE clients poll
//! those snapshots until the task reaches a terminal state.

use std::convert::Infallible;
use std::path::{Component, Path as StdPath, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::downloader::{AudioDownloader, Progress, TaskStatus};
use crate::history::{HistoryStore, NewDownload};
use crate::metadata::{self, MetadataRecord};
use crate::registry::TaskRegistry;
use crate::{youtube, DownloadError, Result};

/// How often SSE streams poll the registry
const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default and maximum page sizes for history queries
const DEFAULT_HISTORY_LIMIT: i64 = 10;
const MAX_HISTORY_LIMIT: i64 = 100;

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    downloader: Arc<AudioDownloader>,
    registry: Arc<TaskRegistry>,
    history: HistoryStore,
}

/// Structured JSON error response
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Run the web server until it is shut down
pub async fn serve(config: Config) -> Result<()> {
    config.ensure_dirs()?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let history = HistoryStore::open(&config.paths.history_db).await?;
    let registry = Arc::new(TaskRegistry::new(Duration::from_secs(
        config.server.task_ttl,
    )));
    let downloader = Arc::new(AudioDownloader::new(config.clone()));

    let state = AppState {
        config: Arc::new(config),
        downloader,
        registry,
        history,
    };

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router(state))
        .await
        .context("Server error")?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/info", get(video_info))
        .route("/api/download", post(start_download))
        .route("/api/progress/:task_id", get(progress_stream))
        .route("/api/history", get(list_history))
        .route("/api/stats", get(stats))
        .route("/api/downloads/:filename", get(download_file))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Deserialize)]
struct InfoQuery {
    url: String,
}

async fn video_info(
    State(state): State<AppState>,
    Query(query): Query<InfoQuery>,
) -> std::result::Result<Json<MetadataRecord>, ApiError> {
    if !youtube::is_valid_url(&query.url) {
        return Err(ApiError::bad_request("Invalid YouTube URL"));
    }

    let raw = state
        .downloader
        .video_info(&query.url)
        .await
        .map_err(api_error)?;
    Ok(Json(MetadataRecord::from_raw(&raw, &state.config.audio)))
}

#[derive(Deserialize)]
struct DownloadRequest {
    url: String,
}

async fn start_download(
    State(state): State<AppState>,
    Json(request): Json<DownloadRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    if !youtube::is_valid_url(&request.url) {
        return Err(ApiError::bad_request("Invalid YouTube URL"));
    }

    let url = youtube::normalize_url(&request.url);
    let task_id = state.registry.create(&url);
    info!(%task_id, url = %url, "Download accepted");

    tokio::spawn(run_download_task(state, task_id, url.clone()));

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "task_id": task_id,
            "message": "Download started",
            "url": url,
        })),
    ))
}

/// Drives one accepted download to completion.
///
/// The progress callback is the single writer for this task id. Metadata and
/// history failures are logged but never turn a successful download into an
/// error.
async fn run_download_task(state: AppState, task_id: Uuid, url: String) {
    let registry = state.registry.clone();
    let callback = move |progress: Progress| registry.update(task_id, &progress);

    match state.downloader.download(&url, None, &callback).await {
        Ok(outcome) => {
            let record = MetadataRecord::from_raw(&outcome.raw_info, &state.config.audio);
            if let Err(e) = metadata::save_record(&state.config.paths.metadata_dir, &record) {
                warn!(%task_id, "Could not save metadata record: {}", e);
            }

            let entry = NewDownload {
                url: outcome.url.clone(),
                title: outcome.title.clone(),
                filename: outcome.filename.clone(),
                duration: Some(metadata::format_duration(outcome.duration)),
                uploader: outcome.uploader.clone(),
                file_size: outcome.file_size.map(|s| s as i64),
                video_id: outcome.video_id.clone(),
            };
            if let Err(e) = state.history.add(entry).await {
                warn!(%task_id, "Could not record download in history: {}", e);
            }

            info!(%task_id, filename = %outcome.filename, "Download finished");
        }
        Err(e) => {
            // the callback already moved the task to its error state
            error!(%task_id, url = %url, "Download failed: {}", e);
        }
    }
}

async fn progress_stream(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> std::result::Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>, ApiError>
{
    let task_id = Uuid::parse_str(&task_id)
        .map_err(|_| ApiError::bad_request("Invalid task id"))?;

    if state.registry.get(task_id).is_none() {
        return Err(ApiError::not_found("Unknown task"));
    }

    struct StreamState {
        registry: Arc<TaskRegistry>,
        task_id: Uuid,
        last_status: Option<TaskStatus>,
        first: bool,
        done: bool,
    }

    let stream = futures_util::stream::unfold(
        StreamState {
            registry: state.registry.clone(),
            task_id,
            last_status: None,
            first: true,
            done: false,
        },
        |mut st| async move {
            if st.done {
                return None;
            }
            loop {
                if !st.first {
                    tokio::time::sleep(PROGRESS_POLL_INTERVAL).await;
                }
                st.first = false;

                let Some(task) = st.registry.get(st.task_id) else {
                    // task was swept while the client was connected
                    st.done = true;
                    let event = Event::default().data(r#"{"error":"task expired"}"#);
                    return Some((Ok(event), st));
                };

                let active = matches!(
                    task.status,
                    TaskStatus::Downloading | TaskStatus::Converting
                );
                if st.last_status != Some(task.status) || active {
                    st.last_status = Some(task.status);
                    if task.status.is_terminal() {
                        st.done = true;
                    }
                    let event = Event::default()
                        .json_data(&task)
                        .unwrap_or_else(|_| Event::default().data("{}"));
                    return Some((Ok::<_, Infallible>(event), st));
                }
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn list_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let entries = state.history.list(limit, offset).await.map_err(api_error)?;
    Ok(Json(json!({ "downloads": entries })))
}

async fn stats(
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let stats = state.history.stats().await.map_err(api_error)?;
    Ok(Json(stats))
}

async fn download_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> std::result::Result<Response, ApiError> {
    let path = resolve_download(&state.config.paths.downloads_dir, &filename)?;

    let file = tokio::fs::File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("File not found"))?;
    let stream = ReaderStream::new(file);

    let response = Response::builder()
        .header(header::CONTENT_TYPE, content_type_for(&filename))
        .header(
            header::CONTENT_DISPOSITION,
            build_content_disposition(&filename),
        )
        .body(Body::from_stream(stream))
        .map_err(|e| ApiError::internal(format!("Could not build response: {}", e)))?;
    Ok(response)
}

/// Resolve a requested filename inside the downloads directory.
///
/// The filename must be a single normal path component and the resolved path
/// must stay inside the downloads directory after symlinks are followed.
fn resolve_download(dir: &StdPath, filename: &str) -> std::result::Result<PathBuf, ApiError> {
    let mut components = StdPath::new(filename).components();
    if !matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) {
        return Err(ApiError::forbidden("Access denied"));
    }

    let dir_canonical = dir
        .canonicalize()
        .map_err(|_| ApiError::not_found("File not found"))?;
    let path = match dir_canonical.join(filename).canonicalize() {
        Ok(p) => p,
        Err(_) => return Err(ApiError::not_found("File not found")),
    };

    if !path.starts_with(&dir_canonical) {
        return Err(ApiError::forbidden("Access denied"));
    }
    if !path.is_file() {
        return Err(ApiError::not_found("File not found"));
    }

    Ok(path)
}

fn content_type_for(filename: &str) -> &'static str {
    let ext = StdPath::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    match ext.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" | "mp4" => "audio/mp4",
        "opus" | "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "webm" => "audio/webm",
        "json" => "application/json",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// RFC 5987 Content-Disposition that survives non-ASCII filenames
fn build_content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| if c.is_ascii() && c != '"' { c } else { '_' })
        .collect();
    let encoded = urlencoding::encode(filename);
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        ascii, encoded
    )
}

/// Map library errors to HTTP responses
fn api_error(e: anyhow::Error) -> ApiError {
    match e.downcast_ref::<DownloadError>() {
        Some(DownloadError::InvalidUrl(_)) => ApiError::bad_request(e.to_string()),
        Some(_) => ApiError::internal(e.to_string()),
        None => ApiError::internal(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_download_accepts_plain_filename() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join("song.mp3"), b"data").unwrap();

        let resolved = resolve_download(dir.path(), "song.mp3").unwrap();
        assert!(resolved.ends_with("song.mp3"));
    }

    #[test]
    fn test_resolve_download_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();

        for candidate in [
            "../etc/passwd",
            "..",
            "a/../../b.mp3",
            "/etc/passwd",
            "sub/dir.mp3",
        ] {
            let err = resolve_download(dir.path(), candidate).unwrap_err();
            assert_eq!(err.status, StatusCode::FORBIDDEN, "for {}", candidate);
        }
    }

    #[test]
    fn test_resolve_download_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = resolve_download(dir.path(), "missing.mp3").unwrap_err();
        assert_eq!(err.status, StatusCode::NOT_FOUND);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_download_rejects_symlink_escape() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        fs_err::write(outside.path().join("secret.txt"), b"x").unwrap();

        std::os::unix::fs::symlink(
            outside.path().join("secret.txt"),
            dir.path().join("link.mp3"),
        )
        .unwrap();

        let err = resolve_download(dir.path(), "link.mp3").unwrap_err();
        assert_eq!(err.status, StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("song.mp3"), "audio/mpeg");
        assert_eq!(content_type_for("SONG.MP3"), "audio/mpeg");
        assert_eq!(content_type_for("clip.webm"), "audio/webm");
        assert_eq!(content_type_for("info.json"), "application/json");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn test_build_content_disposition_ascii() {
        assert_eq!(
            build_content_disposition("song.mp3"),
            "attachment; filename=\"song.mp3\"; filename*=UTF-8''song.mp3"
        );
    }

    #[test]
    fn test_build_content_disposition_non_ascii() {
        let header = build_content_disposition("müsica.mp3");
        assert!(header.contains("filename=\"m_sica.mp3\""));
        assert!(header.contains("filename*=UTF-8''m%C3%BCsica.mp3"));
    }
}
