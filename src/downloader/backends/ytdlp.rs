// yt-dlp backends: metadata via --dump-json, media piped through stdout,
// and media downloaded to a transient file then streamed from disk.

use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use crate::downloader::errors::BackendError;
use crate::downloader::format_selector::{FormatSelector, OutputTarget};
use crate::downloader::models::{FormatDescriptor, FormatId, MediaKind, MediaRequest, PartialMetadata};
use crate::downloader::storage::{StorageManager, TransientFile};
use crate::downloader::tools::ToolManager;
use crate::downloader::traits::{ByteStream, MediaSource, MetadataBackend, StreamBackend};
use crate::downloader::utils::{read_tail, run_output_with_timeout, STDERR_TAIL_BYTES};

/// Options passed to every yt-dlp invocation
#[derive(Debug, Clone)]
pub struct YtDlpSettings {
    pub proxy: Option<String>,
    pub cookies: Option<PathBuf>,
    pub metadata_timeout_secs: u64,
    pub download_timeout_secs: u64,
}

impl Default for YtDlpSettings {
    fn default() -> Self {
        Self {
            proxy: None,
            cookies: None,
            metadata_timeout_secs: 30,
            download_timeout_secs: 1800,
        }
    }
}

/// Shared yt-dlp invocation state: the provisioned executable and its options
#[derive(Clone)]
pub struct YtDlp {
    tools: Arc<ToolManager>,
    settings: YtDlpSettings,
}

impl YtDlp {
    pub fn new(tools: Arc<ToolManager>, settings: YtDlpSettings) -> Self {
        Self { tools, settings }
    }

    /// Waits for provisioning to finish; unavailable means this attempt fails fast
    async fn executable(&self) -> Result<PathBuf, BackendError> {
        self.tools
            .executable()
            .await
            .ok_or_else(|| BackendError::ToolNotFound("yt-dlp is not installed and could not be provisioned".to_string()))
    }

    fn common_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--no-progress".to_string(),
            "--socket-timeout".to_string(),
            self.settings.metadata_timeout_secs.to_string(),
        ];
        if let Some(proxy) = &self.settings.proxy {
            args.push("--proxy".to_string());
            args.push(proxy.clone());
        }
        if let Some(cookies) = &self.settings.cookies {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        args
    }

    pub fn metadata_args(&self, url: &str) -> Vec<String> {
        let mut args = vec!["--dump-json".to_string()];
        args.extend(self.common_args());
        args.push(url.to_string());
        args
    }

    pub fn pipe_args(&self, request: &MediaRequest) -> Vec<String> {
        let spec = FormatSelector::ytdlp_spec(request.kind, request.quality.as_ref(), OutputTarget::Pipe);
        let mut args = vec!["-f".to_string(), spec];
        if request.kind != MediaKind::Audio {
            // mp4 needs a seekable output; Matroska can be written to a pipe
            args.push("--merge-output-format".to_string());
            args.push("mkv".to_string());
        }
        args.extend(["-o".to_string(), "-".to_string()]);
        args.extend(self.common_args());
        args.push(request.url.clone());
        args
    }

    pub fn file_args(&self, request: &MediaRequest, template: &Path) -> Vec<String> {
        let spec = FormatSelector::ytdlp_spec(request.kind, request.quality.as_ref(), OutputTarget::File);
        let mut args = vec!["-f".to_string(), spec];
        match request.kind {
            MediaKind::Audio => args.extend(["-x", "--audio-format", "mp3"].map(String::from)),
            _ => args.extend(["--merge-output-format", "mp4"].map(String::from)),
        }
        args.extend([
            "-o".to_string(),
            template.to_string_lossy().into_owned(),
            "--no-simulate".to_string(),
            "--print".to_string(),
            "after_move:title".to_string(),
            "--print".to_string(),
            "after_move:filepath".to_string(),
        ]);
        args.extend(self.common_args());
        args.push(request.url.clone());
        args
    }
}

/// Metadata through `yt-dlp --dump-json`
pub struct YtDlpBackend {
    ytdlp: YtDlp,
}

impl YtDlpBackend {
    pub fn new(ytdlp: YtDlp) -> Self {
        Self { ytdlp }
    }
}

#[async_trait]
impl MetadataBackend for YtDlpBackend {
    fn name(&self) -> &'static str {
        "yt-dlp"
    }

    async fn fetch_metadata(&self, request: &MediaRequest) -> Result<PartialMetadata, BackendError> {
        let program = self.ytdlp.executable().await?;
        let output = run_output_with_timeout(
            &program.to_string_lossy(),
            self.ytdlp.metadata_args(&request.url),
            self.ytdlp.settings.metadata_timeout_secs,
        )
        .await?;

        if !output.status.success() {
            return Err(BackendError::from_exit(
                output.status.code(),
                &String::from_utf8_lossy(&output.stderr),
            ));
        }

        parse_dump_json(&output.stdout)
    }
}

/// Map yt-dlp's info JSON onto partial metadata
pub fn parse_dump_json(stdout: &[u8]) -> Result<PartialMetadata, BackendError> {
    let json: Value = serde_json::from_slice(stdout)
        .map_err(|e| BackendError::ParseError(format!("Failed to parse yt-dlp JSON: {}", e)))?;

    let formats = json["formats"]
        .as_array()
        .map(|list| list.iter().map(parse_format).collect())
        .unwrap_or_default();

    Ok(PartialMetadata {
        title: json["title"].as_str().map(String::from),
        author: json["uploader"]
            .as_str()
            .or_else(|| json["channel"].as_str())
            .map(String::from),
        duration_seconds: json["duration"].as_f64().map(|d| d.round() as u64),
        view_count: json["view_count"].as_u64(),
        thumbnail_url: json["thumbnail"].as_str().map(String::from),
        description: json["description"].as_str().map(String::from),
        upload_date: json["upload_date"].as_str().map(format_upload_date),
        formats,
    })
}

fn parse_format(format: &Value) -> FormatDescriptor {
    let has_codec = |key: &str| format[key].as_str().is_some_and(|codec| codec != "none");
    FormatDescriptor {
        quality_label: format["format_note"]
            .as_str()
            .or_else(|| format["resolution"].as_str())
            .map(String::from),
        container: format["ext"].as_str().map(String::from),
        has_audio: has_codec("acodec"),
        has_video: has_codec("vcodec"),
        format_id: format["format_id"].as_str().map(|id| FormatId::Text(id.to_string())),
    }
}

/// `20091025` -> `2009-10-25`
fn format_upload_date(raw: &str) -> String {
    if raw.len() == 8 && raw.bytes().all(|b| b.is_ascii_digit()) {
        format!("{}-{}-{}", &raw[0..4], &raw[4..6], &raw[6..8])
    } else {
        raw.to_string()
    }
}

/// Media piped through yt-dlp's stdout
pub struct YtDlpPipeBackend {
    ytdlp: YtDlp,
}

impl YtDlpPipeBackend {
    pub fn new(ytdlp: YtDlp) -> Self {
        Self { ytdlp }
    }
}

#[async_trait]
impl StreamBackend for YtDlpPipeBackend {
    fn name(&self) -> &'static str {
        "yt-dlp-pipe"
    }

    async fn open_stream(&self, request: &MediaRequest) -> Result<MediaSource, BackendError> {
        let program = self.ytdlp.executable().await?;
        let body = stdout_stream(&program, &self.ytdlp.pipe_args(request))?;

        let (content_type, extension) = match request.kind {
            MediaKind::Audio => ("application/octet-stream", "m4a"),
            _ => ("video/x-matroska", "mkv"),
        };

        Ok(MediaSource {
            body,
            content_type: content_type.to_string(),
            extension: extension.to_string(),
            content_length: None,
            title: None,
        })
    }
}

struct PipeState {
    reader: ReaderStream<ChildStdout>,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    finished: bool,
}

/// Spawn `program` and expose its stdout as a byte stream.
///
/// The stream owns the child: dropping it (client disconnect) kills the
/// process. A non-zero exit after stdout closes is reported as a final error
/// item carrying the tail of stderr.
pub fn stdout_stream(program: &Path, args: &[String]) -> Result<ByteStream, BackendError> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackendError::ToolNotFound(format!("Failed to start {}: {}", program.display(), e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| BackendError::ExecutionError(format!("Failed to capture stdout from {}", program.display())))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| BackendError::ExecutionError(format!("Failed to capture stderr from {}", program.display())))?;

    let stderr = tokio::spawn(async move {
        let buf = read_tail(stderr_pipe, STDERR_TAIL_BYTES).await.unwrap_or_default();
        String::from_utf8_lossy(&buf).into_owned()
    });

    let state = PipeState {
        reader: ReaderStream::new(stdout),
        child,
        stderr: Some(stderr),
        finished: false,
    };

    let body = stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        match state.reader.next().await {
            Some(Ok(chunk)) => Some((Ok(chunk), state)),
            Some(Err(e)) => {
                state.finished = true;
                Some((Err(e), state))
            }
            None => {
                state.finished = true;
                let status = match state.child.wait().await {
                    Ok(status) => status,
                    Err(e) => return Some((Err(e), state)),
                };
                if status.success() {
                    return None;
                }
                let stderr = match state.stderr.take() {
                    Some(task) => task.await.unwrap_or_default(),
                    None => String::new(),
                };
                let err = BackendError::from_exit(status.code(), &stderr);
                Some((Err(io::Error::other(err.to_string())), state))
            }
        }
    });

    Ok(body.boxed())
}

/// Media downloaded by yt-dlp into the transient directory, then streamed
/// from disk. The file is removed shortly after the stream is dropped.
pub struct YtDlpFileBackend {
    ytdlp: YtDlp,
    storage: Arc<StorageManager>,
}

impl YtDlpFileBackend {
    pub fn new(ytdlp: YtDlp, storage: Arc<StorageManager>) -> Self {
        Self { ytdlp, storage }
    }
}

#[async_trait]
impl StreamBackend for YtDlpFileBackend {
    fn name(&self) -> &'static str {
        "yt-dlp-file"
    }

    async fn open_stream(&self, request: &MediaRequest) -> Result<MediaSource, BackendError> {
        let program = self.ytdlp.executable().await?;
        let dir = self.storage.temp_dir();
        let prefix = self.storage.transient_prefix(request.kind);
        let template = dir.join(format!("{}.%(ext)s", prefix));

        let output = run_output_with_timeout(
            &program.to_string_lossy(),
            self.ytdlp.file_args(request, &template),
            self.ytdlp.settings.download_timeout_secs,
        )
        .await;

        let output = match output {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                remove_with_prefix(dir, &prefix).await;
                return Err(BackendError::from_exit(
                    output.status.code(),
                    &String::from_utf8_lossy(&output.stderr),
                ));
            }
            Err(e) => {
                remove_with_prefix(dir, &prefix).await;
                return Err(e);
            }
        };

        let (title, path) = resolve_output(&String::from_utf8_lossy(&output.stdout), dir, &prefix)?;
        debug!(file = %path.display(), "yt-dlp wrote transient file");

        let guard = TransientFile::new(path.clone(), self.storage.cleanup_delay());
        let file = tokio::fs::File::open(&path).await?;
        let content_length = file.metadata().await.ok().map(|m| m.len());

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or(match request.kind {
                MediaKind::Audio => "mp3",
                _ => "mp4",
            })
            .to_string();

        let body = GuardedStream {
            inner: ReaderStream::new(file).boxed(),
            _guard: guard,
        }
        .boxed();

        Ok(MediaSource {
            body,
            content_type: content_type_for(&extension).to_string(),
            extension,
            content_length,
            title,
        })
    }
}

/// Locate the finished file: the printed `after_move:filepath` if present,
/// otherwise the newest file in `dir` carrying `prefix`.
pub fn resolve_output(stdout: &str, dir: &Path, prefix: &str) -> Result<(Option<String>, PathBuf), BackendError> {
    let lines: Vec<&str> = stdout.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if let [.., title, path] = lines.as_slice() {
        let path = PathBuf::from(path);
        if path.is_file() {
            return Ok((Some(title.to_string()), path));
        }
    }

    warn!(prefix = %prefix, "yt-dlp did not report its output path, scanning transient directory");
    newest_with_prefix(dir, prefix).map(|path| (None, path)).ok_or_else(|| {
        BackendError::ExecutionError(format!("yt-dlp finished but no file with prefix {} was found", prefix))
    })
}

fn newest_with_prefix(dir: &Path, prefix: &str) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(prefix) && !name.ends_with(".part")
        })
        .filter_map(|entry| {
            let meta = entry.metadata().ok()?;
            meta.is_file()
                .then(|| (meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), entry.path()))
        })
        .max_by_key(|(modified, _)| *modified)
        .map(|(_, path)| path)
}

/// Clear fragments and partial output left behind by a failed run
async fn remove_with_prefix(dir: &Path, prefix: &str) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else { return };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().starts_with(prefix) {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!(file = %entry.path().display(), error = %e, "failed to remove partial yt-dlp output");
            }
        }
    }
}

fn content_type_for(extension: &str) -> &'static str {
    match extension {
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "opus" | "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

/// File-backed body that keeps its TransientFile alive until dropped
struct GuardedStream {
    inner: ByteStream,
    _guard: TransientFile,
}

impl Stream for GuardedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}
