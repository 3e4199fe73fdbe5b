// Fetcher - tries extractor backends in priority order

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{future, stream, StreamExt, TryStreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use super::backends::{
    InnertubeBackend, WatchPageBackend, YtDlp, YtDlpBackend, YtDlpFileBackend, YtDlpPipeBackend, YtDlpSettings,
};
use super::errors::{BackendError, BackendFailure, FetchError};
use super::models::{
    MediaKind, MediaMetadata, MediaRequest, PartialMetadata, Quality, SavedDownload, StreamHandle,
};
use super::storage::{StorageManager, TransientFile};
use super::tools::ToolManager;
use super::traits::{ByteStream, MetadataBackend, StreamBackend};
use super::utils::{build_filename, unix_millis};

/// How long a stream backend may take to produce its first byte
pub const DEFAULT_FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(60);

pub struct Fetcher {
    metadata_backends: Vec<Arc<dyn MetadataBackend>>,
    stream_backends: Vec<Arc<dyn StreamBackend>>,
    storage: Arc<StorageManager>,
    first_byte_timeout: Duration,
}

impl Fetcher {
    pub fn new(storage: Arc<StorageManager>) -> Self {
        Self {
            metadata_backends: Vec::new(),
            stream_backends: Vec::new(),
            storage,
            first_byte_timeout: DEFAULT_FIRST_BYTE_TIMEOUT,
        }
    }

    pub fn with_first_byte_timeout(mut self, timeout: Duration) -> Self {
        self.first_byte_timeout = timeout;
        self
    }

    /// Production wiring.
    ///
    /// Metadata: player API, then the watch page, then `yt-dlp --dump-json`.
    /// Streams: yt-dlp piped through stdout, then the player API's direct
    /// URLs, then yt-dlp into a transient file.
    pub fn standard(
        client: reqwest::Client,
        tools: Arc<ToolManager>,
        storage: Arc<StorageManager>,
        settings: YtDlpSettings,
    ) -> Self {
        let timeout = Duration::from_secs(settings.metadata_timeout_secs);
        let ytdlp = YtDlp::new(tools, settings);
        let innertube = Arc::new(InnertubeBackend::new(client.clone(), timeout));

        let mut fetcher = Self::new(storage.clone());
        fetcher.add_metadata_backend(innertube.clone());
        fetcher.add_metadata_backend(Arc::new(WatchPageBackend::new(client, timeout)));
        fetcher.add_metadata_backend(Arc::new(YtDlpBackend::new(ytdlp.clone())));

        fetcher.add_stream_backend(Arc::new(YtDlpPipeBackend::new(ytdlp.clone())));
        fetcher.add_stream_backend(innertube);
        fetcher.add_stream_backend(Arc::new(YtDlpFileBackend::new(ytdlp, storage)));
        fetcher
    }

    pub fn add_metadata_backend(&mut self, backend: Arc<dyn MetadataBackend>) {
        self.metadata_backends.push(backend);
    }

    pub fn add_stream_backend(&mut self, backend: Arc<dyn StreamBackend>) {
        self.stream_backends.push(backend);
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    /// Merge metadata from backends until one supplies formats.
    ///
    /// Lenient: a valid URL that nothing could introspect still yields the
    /// default payload. Only an invalid URL is an error.
    pub async fn resolve_metadata(&self, url: &str) -> Result<MediaMetadata, FetchError> {
        let request = MediaRequest::new(url, MediaKind::Metadata, None)?;
        let mut merged = PartialMetadata::default();

        for backend in &self.metadata_backends {
            let name = backend.name();
            info!(backend = name, url = %request.url, "trying metadata backend");

            match backend.fetch_metadata(&request).await {
                Ok(partial) => {
                    debug!(backend = name, formats = partial.formats.len(), "metadata backend answered");
                    merged.merge(partial);
                    if merged.has_formats() {
                        info!(backend = name, formats = merged.formats.len(), "metadata resolved");
                        break;
                    }
                }
                Err(e) => log_failure(name, &e, "metadata backend failed"),
            }
        }

        if merged.title.is_none() && !merged.has_formats() {
            warn!(url = %request.url, "no backend could introspect url, returning default metadata");
        }
        Ok(merged.into_metadata())
    }

    /// Open a media stream, committing to the first backend that produces bytes
    pub async fn resolve_stream(
        &self,
        url: &str,
        kind: MediaKind,
        quality: Option<Quality>,
    ) -> Result<StreamHandle, FetchError> {
        let request = MediaRequest::new(url, kind, quality)?;
        self.stream(&request).await
    }

    /// Save a video into the managed downloads directory.
    ///
    /// Bytes go to a hidden `.part` file that is renamed into place only
    /// after it is flushed and synced. If the save fails or the caller stops
    /// polling, the guard removes the partial file.
    pub async fn download_to_server(&self, url: &str, quality: Option<Quality>) -> Result<SavedDownload, FetchError> {
        let request = MediaRequest::new(url, MediaKind::Video, quality)?;
        let dir = self.storage.ensure_writable()?.to_path_buf();

        let handle = self.stream(&request).await?;
        let path = dir.join(&handle.filename);
        let partial = TransientFile::new(dir.join(format!(".{}.part", handle.filename)), Duration::ZERO);

        let saved = match write_body(partial.path(), handle.body).await {
            Ok(bytes) => tokio::fs::rename(partial.path(), &path).await.map(|_| bytes),
            Err(e) => Err(e),
        };

        match saved {
            Ok(bytes) => {
                info!(file = %path.display(), bytes, backend = handle.backend, "saved download");
                Ok(SavedDownload {
                    filename: handle.filename,
                    path,
                    bytes,
                })
            }
            Err(e) => {
                warn!(file = %path.display(), error = %e, "save failed, removing partial file");
                Err(FetchError::SaveFailed(format!("{}: {}", handle.filename, e)))
            }
        }
    }

    async fn stream(&self, request: &MediaRequest) -> Result<StreamHandle, FetchError> {
        if request.kind == MediaKind::Metadata {
            return Err(FetchError::InvalidInput("metadata requests cannot be streamed".to_string()));
        }

        let mut failures = Vec::new();

        for backend in &self.stream_backends {
            let name = backend.name();
            info!(backend = name, url = %request.url, kind = %request.kind, "trying stream backend");

            let mut source = match backend.open_stream(request).await {
                Ok(source) => source,
                Err(e) => {
                    log_failure(name, &e, "stream backend failed to open");
                    failures.push(BackendFailure { backend: name, error: e });
                    continue;
                }
            };

            // Nothing has been sent yet: a stream that dies before its first
            // byte is an ordinary backend failure.
            let first = match first_chunk(&mut source.body, self.first_byte_timeout).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    log_failure(name, &e, "stream backend produced no data");
                    failures.push(BackendFailure { backend: name, error: e });
                    continue;
                }
            };

            info!(backend = name, url = %request.url, "stream committed");

            let body: ByteStream = stream::once(future::ready(Ok(first)))
                .chain(source.body)
                .inspect_err(move |e| {
                    warn!(backend = name, error = %e, "stream failed after commit, response truncated");
                })
                .boxed();

            return Ok(StreamHandle {
                body,
                content_type: source.content_type,
                filename: build_filename(source.title.as_deref(), request.kind, &source.extension, unix_millis()),
                content_length: source.content_length,
                backend: name,
            });
        }

        error!(url = %request.url, kind = %request.kind, attempts = failures.len(), "all stream backends failed");
        Err(FetchError::AllBackendsFailed(failures))
    }
}

fn log_failure(backend: &'static str, error: &BackendError, message: &str) {
    match error.blocking_reason() {
        Some(reason) => warn!(
            backend,
            error = %error,
            reason = reason.description(),
            retryable = reason.is_retryable(),
            permanent = reason.is_permanent(),
            "{}",
            message
        ),
        None => warn!(backend, error = %error, "{}", message),
    }
}

/// Wait for the first non-empty chunk, giving up after `limit`
async fn first_chunk(body: &mut ByteStream, limit: Duration) -> Result<Bytes, BackendError> {
    let wait = async {
        loop {
            match body.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => continue,
                Some(Ok(chunk)) => return Ok(chunk),
                Some(Err(e)) => return Err(BackendError::from(e.to_string())),
                None => return Err(BackendError::EmptyStream),
            }
        }
    };
    tokio::time::timeout(limit, wait).await.unwrap_or_else(|_| {
        Err(BackendError::NetworkTimeout(format!(
            "no data within {}s",
            limit.as_secs_f32()
        )))
    })
}

async fn write_body(path: &Path, mut body: ByteStream) -> io::Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}
