use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tower::ServiceExt;

use youtube_downloader_server::downloader::storage::probe_writable;
use youtube_downloader_server::downloader::{
    BackendError, Fetcher, MediaRequest, MediaSource, MetadataBackend, StorageManager, StreamBackend, ToolConfig,
    ToolManager,
};
use youtube_downloader_server::downloader::models::PartialMetadata;
use youtube_downloader_server::server::{router, AppState};

struct FailingMetadata;

#[async_trait]
impl MetadataBackend for FailingMetadata {
    fn name(&self) -> &'static str {
        "failing"
    }

    async fn fetch_metadata(&self, _request: &MediaRequest) -> Result<PartialMetadata, BackendError> {
        Err(BackendError::Http("offline".to_string()))
    }
}

struct FixedStream {
    calls: Arc<AtomicUsize>,
    payload: Option<&'static str>,
}

#[async_trait]
impl StreamBackend for FixedStream {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn open_stream(&self, _request: &MediaRequest) -> Result<MediaSource, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let payload = self
            .payload
            .ok_or_else(|| BackendError::ExecutionError("exit code Some(1)".to_string()))?;
        let items: Vec<io::Result<Bytes>> = vec![Ok(Bytes::from(payload))];
        Ok(MediaSource {
            body: stream::iter(items).boxed(),
            content_type: "video/mp4".to_string(),
            extension: "mp4".to_string(),
            content_length: Some(payload.len() as u64),
            title: Some("Café clip".to_string()),
        })
    }
}

struct TestApp {
    app: Router,
    storage: Arc<StorageManager>,
    stream_calls: Arc<AtomicUsize>,
    _tmp: tempfile::TempDir,
}

fn test_app(payload: Option<&'static str>) -> TestApp {
    let tmp = tempfile::tempdir().unwrap();
    let storage = Arc::new(StorageManager::resolve_with(
        &tmp.path().join("downloads"),
        tmp.path(),
        Duration::from_millis(10),
        probe_writable,
    ));

    let stream_calls = Arc::new(AtomicUsize::new(0));
    let mut fetcher = Fetcher::new(storage.clone());
    fetcher.add_metadata_backend(Arc::new(FailingMetadata));
    fetcher.add_stream_backend(Arc::new(FixedStream {
        calls: stream_calls.clone(),
        payload,
    }));

    let tools = Arc::new(ToolManager::new(
        ToolConfig {
            configured_path: None,
            system_paths: Vec::new(),
            managed_dir: tmp.path().join("bin"),
            release: "2025.01.26".to_string(),
            release_base_url: "http://127.0.0.1:9".to_string(),
            search_path: false,
        },
        reqwest::Client::new(),
    ));

    let app = router(AppState {
        fetcher: Arc::new(fetcher),
        storage: storage.clone(),
        tools,
    });

    TestApp {
        app,
        storage,
        stream_calls,
        _tmp: tmp,
    }
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn saved_file(storage: &StorageManager, name: &str, contents: &[u8]) {
    std::fs::write(storage.downloads_dir().join(name), contents).unwrap();
}

fn exists(storage: &StorageManager, name: &str) -> bool {
    storage.downloads_dir().join(name).exists()
}

fn encode_segment(segment: &str) -> String {
    segment
        .bytes()
        .map(|b| {
            if b.is_ascii_alphanumeric() || b"-._~".contains(&b) {
                (b as char).to_string()
            } else {
                format!("%{:02X}", b)
            }
        })
        .collect()
}

#[tokio::test]
async fn video_info_rejects_invalid_urls() {
    let t = test_app(Some("data"));

    let response = t
        .app
        .clone()
        .oneshot(post_json("/api/video-info", json!({"url": "https://example.com/video"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].is_string());

    let response = t
        .app
        .clone()
        .oneshot(post_json("/api/video-info", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let t = test_app(Some("data"));
    let request = Request::builder()
        .method("POST")
        .uri("/api/download")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();

    let response = t.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(t.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn video_info_is_lenient_for_valid_urls() {
    let t = test_app(Some("data"));
    let response = t
        .app
        .oneshot(post_json("/api/video-info", json!({"url": "https://youtu.be/abc123XYZ"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["title"], "Unknown title");
    assert_eq!(body["formats"], json!([]));
}

#[tokio::test]
async fn failed_download_is_json_without_attachment_headers() {
    let t = test_app(None);
    let response = t
        .app
        .oneshot(post_json(
            "/api/download",
            json!({"url": "https://youtube.com/shorts/abc123XYZ", "quality": "highest"}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(response.headers().get(header::CONTENT_DISPOSITION).is_none());
    let body = json_body(response).await;
    assert!(body["error"].is_string());
    assert!(body["message"].as_str().unwrap().contains("fixed"));
}

#[tokio::test]
async fn download_streams_with_attachment_headers() {
    let t = test_app(Some("media-bytes"));
    let response = t
        .app
        .oneshot(post_json(
            "/api/download-audio",
            json!({"url": "https://www.youtube.com/watch?v=abc123XYZ", "quality": 140}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(response.headers()[header::CONTENT_LENGTH], "11");
    let disposition = response.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
    assert!(disposition.starts_with("attachment; filename=\"Caf_ clip-"));
    assert!(disposition.contains("filename*=UTF-8''Caf%C3%A9%20clip-"));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"media-bytes");
}

#[tokio::test]
async fn download_to_server_then_list_serve_and_delete() {
    let t = test_app(Some("saved-bytes"));

    let response = t
        .app
        .clone()
        .oneshot(post_json(
            "/api/download-to-server",
            json!({"url": "https://www.youtube.com/watch?v=abc123XYZ"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let saved = json_body(response).await;
    assert_eq!(saved["success"], true);
    let filename = saved["filename"].as_str().unwrap().to_string();
    assert!(exists(&t.storage, &filename));

    let listing = json_body(t.app.clone().oneshot(get("/api/downloads")).await.unwrap()).await;
    assert_eq!(listing[0]["filename"], filename.as_str());
    assert_eq!(listing[0]["size"], 11);
    assert!(listing[0]["downloadUrl"].as_str().unwrap().starts_with("/downloads/"));

    let served = t
        .app
        .clone()
        .oneshot(get(&format!("/downloads/{}", encode_segment(&filename))))
        .await
        .unwrap();
    assert_eq!(served.status(), StatusCode::OK);
    let bytes = to_bytes(served.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"saved-bytes");

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/api/downloads/{}", encode_segment(&filename)))
        .body(Body::empty())
        .unwrap();
    let response = t.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"success": true}));
    assert!(!exists(&t.storage, &filename));
}

#[tokio::test]
async fn listing_twice_returns_the_same_entries() {
    let t = test_app(Some("data"));
    saved_file(&t.storage, "one.mp4", b"1");
    saved_file(&t.storage, "two.mp3", b"22");

    let first = json_body(t.app.clone().oneshot(get("/api/downloads")).await.unwrap()).await;
    let second = json_body(t.app.oneshot(get("/api/downloads")).await.unwrap()).await;
    assert_eq!(first, second);
    assert_eq!(first.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn deleting_a_missing_file_fails() {
    let t = test_app(Some("data"));
    let request = Request::builder()
        .method("DELETE")
        .uri("/api/downloads/missing.mp4")
        .body(Body::empty())
        .unwrap();

    let response = t.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(json_body(response).await["error"].is_string());
}

#[tokio::test]
async fn health_reports_storage_state() {
    let t = test_app(Some("data"));
    let response = t.app.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["downloadsWritable"], true);
    assert_eq!(body["usingFallbackDir"], false);
    assert!(body["downloadsDir"].as_str().unwrap().ends_with("downloads"));
    assert!(body["ytDlpPath"].is_null());
    assert!(body["timestamp"].is_string());
}
