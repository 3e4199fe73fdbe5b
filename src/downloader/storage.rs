// Ephemeral storage: the managed downloads directory and transient files

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use super::errors::FetchError;
use super::models::MediaKind;
use super::utils::unix_millis;

const FALLBACK_DOWNLOADS_DIR: &str = "youtube-downloads";
const TRANSIENT_DIR: &str = "youtube-downloader-transient";

static PREFIX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Entry returned by the downloads listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedFile {
    pub filename: String,
    pub size: u64,
    pub created: String,
    pub download_url: String,
}

/// Resolved locations for saved and transient files. Built once at startup
/// and shared read-only afterwards.
#[derive(Debug, Clone)]
pub struct StorageManager {
    downloads_dir: PathBuf,
    temp_dir: PathBuf,
    using_fallback: bool,
    writable: bool,
    cleanup_delay: Duration,
}

impl StorageManager {
    /// Resolve the downloads directory, falling back to the platform temp
    /// directory when the preferred one cannot be created or written.
    pub fn resolve(preferred: &Path, cleanup_delay: Duration) -> Self {
        Self::resolve_with(preferred, &std::env::temp_dir(), cleanup_delay, probe_writable)
    }

    pub fn resolve_with(
        preferred: &Path,
        temp_root: &Path,
        cleanup_delay: Duration,
        probe: impl Fn(&Path) -> io::Result<()>,
    ) -> Self {
        let candidates = [
            preferred.to_path_buf(),
            temp_root.join(FALLBACK_DOWNLOADS_DIR),
            temp_root.to_path_buf(),
        ];

        let mut resolved = None;
        for (index, dir) in candidates.iter().enumerate() {
            match fs::create_dir_all(dir).and_then(|_| probe(dir)) {
                Ok(()) => {
                    resolved = Some((dir.clone(), index > 0));
                    break;
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "downloads directory is not writable");
                }
            }
        }

        let (downloads_dir, using_fallback, writable) = match resolved {
            Some((dir, fallback)) => (dir, fallback, true),
            None => (preferred.to_path_buf(), false, false),
        };

        if using_fallback {
            info!(dir = %downloads_dir.display(), "using fallback downloads directory");
        }

        let temp_dir = temp_root.join(TRANSIENT_DIR);
        if let Err(e) = fs::create_dir_all(&temp_dir) {
            warn!(dir = %temp_dir.display(), error = %e, "failed to create transient directory");
        }

        Self {
            downloads_dir,
            temp_dir,
            using_fallback,
            writable,
            cleanup_delay,
        }
    }

    pub fn downloads_dir(&self) -> &Path {
        &self.downloads_dir
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub fn using_fallback(&self) -> bool {
        self.using_fallback
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    pub fn cleanup_delay(&self) -> Duration {
        self.cleanup_delay
    }

    pub fn ensure_writable(&self) -> Result<&Path, FetchError> {
        if self.writable {
            Ok(&self.downloads_dir)
        } else {
            Err(FetchError::StorageUnavailable(format!(
                "{} is not writable and no fallback directory was usable",
                self.downloads_dir.display()
            )))
        }
    }

    /// Unique name prefix for a transient download
    pub fn transient_prefix(&self, kind: MediaKind) -> String {
        let n = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
        format!("ytdl-{}-{}-{}", kind.as_str(), unix_millis(), n)
    }

    /// Path of a saved download, if the name is safe and the file exists
    pub fn saved_path(&self, filename: &str) -> Result<PathBuf, FetchError> {
        validate_filename(filename)?;
        let path = self.downloads_dir.join(filename);
        if path.is_file() {
            Ok(path)
        } else {
            Err(FetchError::NotFound(filename.to_string()))
        }
    }

    pub fn list_saved(&self) -> Result<Vec<SavedFile>, FetchError> {
        let entries = fs::read_dir(&self.downloads_dir)
            .map_err(|e| FetchError::StorageUnavailable(format!("{}: {}", self.downloads_dir.display(), e)))?;

        let mut files = Vec::new();
        for entry in entries.flatten() {
            let filename = entry.file_name().to_string_lossy().into_owned();
            if filename.starts_with('.') {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_file() {
                continue;
            }
            let created = meta.created().or_else(|_| meta.modified()).unwrap_or(UNIX_EPOCH);
            files.push((created, SavedFile {
                download_url: format!("/downloads/{}", filename),
                size: meta.len(),
                created: format_time(created),
                filename,
            }));
        }

        files.sort_by(|(ta, a), (tb, b)| tb.cmp(ta).then_with(|| a.filename.cmp(&b.filename)));
        Ok(files.into_iter().map(|(_, f)| f).collect())
    }

    pub fn delete_saved(&self, filename: &str) -> Result<(), FetchError> {
        let path = self.saved_path(filename)?;
        fs::remove_file(&path)
            .map_err(|e| FetchError::StorageUnavailable(format!("failed to delete {}: {}", filename, e)))?;
        info!(file = %filename, "deleted saved download");
        Ok(())
    }
}

/// Create and delete a uniquely named marker. mkdir succeeding says nothing
/// about whether files can be written.
pub fn probe_writable(dir: &Path) -> io::Result<()> {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let marker = dir.join(format!(".write-probe-{}-{}", std::process::id(), nanos));
    fs::OpenOptions::new().write(true).create_new(true).open(&marker)?;
    fs::remove_file(&marker)
}

fn validate_filename(filename: &str) -> Result<(), FetchError> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains('/')
        || filename.contains('\\')
        || filename.contains('\0')
    {
        return Err(FetchError::InvalidInput(format!("Invalid filename: {}", filename)));
    }
    Ok(())
}

fn format_time(t: SystemTime) -> String {
    OffsetDateTime::from(t)
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Owns a download-then-stream artifact. Dropping the guard schedules the
/// file's removal after `delay`, so the read handle is closed first.
#[derive(Debug)]
pub struct TransientFile {
    path: PathBuf,
    delay: Duration,
}

impl TransientFile {
    pub fn new(path: PathBuf, delay: Duration) -> Self {
        Self { path, delay }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TransientFile {
    fn drop(&mut self) {
        let path = std::mem::take(&mut self.path);
        let delay = self.delay;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    remove_transient(&path).await;
                });
            }
            Err(_) => {
                if let Err(e) = fs::remove_file(&path) {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(file = %path.display(), error = %e, "failed to remove transient file");
                    }
                }
            }
        }
    }
}

async fn remove_transient(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(file = %path.display(), "removed transient file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(file = %path.display(), error = %e, "failed to remove transient file"),
    }
}
