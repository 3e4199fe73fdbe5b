// yt-dlp provisioning: locate the executable or install a pinned release

use std::path::{Path, PathBuf};
use std::process::Command;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::OnceCell;
use tracing::{info, warn};

const BINARY_NAME: &str = "yt-dlp";
const RELEASE_BASE_URL: &str = "https://github.com/yt-dlp/yt-dlp/releases/download";

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("server returned HTTP {0}")]
    Status(reqwest::StatusCode),

    #[error("could not make {0} executable")]
    Permission(PathBuf),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for ProvisionError {
    fn from(e: reqwest::Error) -> Self {
        Self::Download(e.to_string())
    }
}

/// Where to look for yt-dlp and where to install it
#[derive(Debug, Clone)]
pub struct ToolConfig {
    /// Explicit override, checked first
    pub configured_path: Option<PathBuf>,
    /// Well-known system install locations
    pub system_paths: Vec<PathBuf>,
    /// Directory the managed copy lives in
    pub managed_dir: PathBuf,
    /// Release tag to download when nothing is installed
    pub release: String,
    /// Base URL the release assets are fetched from
    pub release_base_url: String,
    /// Look the binary up on PATH as part of the system search
    pub search_path: bool,
}

impl ToolConfig {
    pub fn new(configured_path: Option<PathBuf>, managed_dir: PathBuf, release: String) -> Self {
        Self {
            configured_path,
            system_paths: vec![
                PathBuf::from("/usr/local/bin/yt-dlp"),
                PathBuf::from("/usr/bin/yt-dlp"),
                PathBuf::from("/opt/homebrew/bin/yt-dlp"), // Homebrew on Apple Silicon
            ],
            managed_dir,
            release,
            release_base_url: RELEASE_BASE_URL.to_string(),
            search_path: true,
        }
    }

    pub fn managed_path(&self) -> PathBuf {
        self.managed_dir.join(managed_file_name())
    }

    pub fn release_url(&self) -> String {
        format!("{}/{}/{}", self.release_base_url, self.release, release_asset())
    }
}

/// Resolves the yt-dlp executable once per process. Every caller awaits the
/// same resolution; a failed provisioning is remembered as unavailable.
pub struct ToolManager {
    config: ToolConfig,
    client: reqwest::Client,
    location: OnceCell<Option<PathBuf>>,
}

impl ToolManager {
    pub fn new(config: ToolConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            client,
            location: OnceCell::new(),
        }
    }

    /// Resolved executable, provisioning it on first call
    pub async fn executable(&self) -> Option<PathBuf> {
        self.location
            .get_or_init(|| async {
                match self.provision().await {
                    Ok(path) => {
                        info!(path = %path.display(), "yt-dlp ready");
                        Some(path)
                    }
                    Err(e) => {
                        warn!(error = %e, "yt-dlp unavailable; external-process backends will be skipped");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Resolved executable if provisioning already finished (never blocks)
    pub fn cached(&self) -> Option<PathBuf> {
        self.location.get().cloned().flatten()
    }

    /// Search existing installs in priority order
    pub fn find_installed(&self) -> Option<PathBuf> {
        if let Some(path) = &self.config.configured_path {
            if is_executable(path) {
                return Some(path.clone());
            }
            warn!(path = %path.display(), "configured yt-dlp path is not executable");
        }

        for path in &self.config.system_paths {
            if is_executable(path) {
                return Some(path.clone());
            }
        }

        if self.config.search_path {
            if let Some(path) = which(BINARY_NAME) {
                return Some(path);
            }
        }

        let managed = self.config.managed_path();
        if is_executable(&managed) {
            return Some(managed);
        }

        None
    }

    async fn provision(&self) -> Result<PathBuf, ProvisionError> {
        if let Some(path) = self.find_installed() {
            return Ok(path);
        }
        info!(release = %self.config.release, "yt-dlp not found, downloading pinned release");
        self.install().await
    }

    /// Download the pinned release asset into the managed directory
    pub async fn install(&self) -> Result<PathBuf, ProvisionError> {
        let url = self.config.release_url();
        let target = self.config.managed_path();
        let partial = target.with_extension("part");
        tokio::fs::create_dir_all(&self.config.managed_dir).await?;

        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(ProvisionError::Status(response.status()));
        }

        let written = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut body = response.bytes_stream();
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<(), ProvisionError>(())
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        tokio::fs::rename(&partial, &target).await?;
        make_executable(&target)?;
        info!(path = %target.display(), url = %url, "installed yt-dlp");
        Ok(target)
    }
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Set the executable bit; fall back to `chmod +x` for sandboxes that reject
/// the direct permission call.
#[cfg(unix)]
pub fn make_executable(path: &Path) -> Result<(), ProvisionError> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)) {
        Ok(()) if is_executable(path) => return Ok(()),
        Ok(()) => warn!(path = %path.display(), "set_permissions had no effect, trying chmod"),
        Err(e) => warn!(path = %path.display(), error = %e, "set_permissions failed, trying chmod"),
    }

    match Command::new("chmod").arg("+x").arg(path).status() {
        Ok(status) if status.success() && is_executable(path) => Ok(()),
        Ok(status) => {
            warn!(path = %path.display(), %status, "chmod +x failed");
            Err(ProvisionError::Permission(path.to_path_buf()))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not run chmod");
            Err(ProvisionError::Permission(path.to_path_buf()))
        }
    }
}

#[cfg(not(unix))]
pub fn make_executable(_path: &Path) -> Result<(), ProvisionError> {
    Ok(())
}

fn which(binary: &str) -> Option<PathBuf> {
    let output = Command::new("which").arg(binary).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let path = String::from_utf8(output.stdout).ok()?;
    let trimmed = path.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(PathBuf::from(trimmed))
    }
}

fn release_asset() -> &'static str {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else if cfg!(target_os = "macos") {
        "yt-dlp_macos"
    } else {
        "yt-dlp_linux"
    }
}

fn managed_file_name() -> &'static str {
    if cfg!(target_os = "windows") {
        "yt-dlp.exe"
    } else {
        BINARY_NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn isolated_config(dir: &Path) -> ToolConfig {
        ToolConfig {
            configured_path: None,
            system_paths: Vec::new(),
            managed_dir: dir.join("bin"),
            release: "2025.01.26".to_string(),
            release_base_url: RELEASE_BASE_URL.to_string(),
            search_path: false,
        }
    }

    /// Serve `/good/<asset>` with a fake binary; every other path is a 404
    async fn release_server() -> String {
        use axum::{routing::get, Router};

        let app = Router::new().route("/good/{asset}", get(|| async { "#!/bin/sh\necho 2025.01.26\n" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn local_client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[test]
    fn test_release_url_is_pinned() {
        let tmp = tempfile::tempdir().unwrap();
        let url = isolated_config(tmp.path()).release_url();
        assert!(url.starts_with("https://github.com/yt-dlp/yt-dlp/releases/download/2025.01.26/yt-dlp"));
    }

    #[cfg(unix)]
    #[test]
    fn test_configured_path_wins_when_executable() {
        let tmp = tempfile::tempdir().unwrap();
        let custom = tmp.path().join("custom-yt-dlp");
        std::fs::write(&custom, b"#!/bin/sh\n").unwrap();
        make_executable(&custom).unwrap();

        let mut config = isolated_config(tmp.path());
        config.configured_path = Some(custom.clone());
        let manager = ToolManager::new(config, reqwest::Client::new());
        assert_eq!(manager.find_installed(), Some(custom));
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_files_are_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let plain = tmp.path().join("yt-dlp-plain");
        std::fs::write(&plain, b"data").unwrap();
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o644)).unwrap();

        let mut config = isolated_config(tmp.path());
        config.configured_path = Some(plain.clone());
        config.system_paths = vec![plain];
        let manager = ToolManager::new(config, reqwest::Client::new());
        assert_eq!(manager.find_installed(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_managed_copy_is_found_and_cached() {
        let tmp = tempfile::tempdir().unwrap();
        let config = isolated_config(tmp.path());
        std::fs::create_dir_all(&config.managed_dir).unwrap();
        let managed = config.managed_path();
        std::fs::write(&managed, b"#!/bin/sh\n").unwrap();
        make_executable(&managed).unwrap();

        let manager = ToolManager::new(config, reqwest::Client::new());
        assert_eq!(manager.cached(), None);
        assert_eq!(manager.executable().await, Some(managed.clone()));
        assert_eq!(manager.cached(), Some(managed));
    }

    #[tokio::test]
    async fn test_install_rejects_error_status() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = isolated_config(tmp.path());
        config.release_base_url = release_server().await;
        config.release = "missing".to_string();
        let managed = config.managed_path();
        let partial = managed.with_extension("part");

        let manager = ToolManager::new(config, local_client());
        match manager.install().await {
            Err(ProvisionError::Status(status)) => assert_eq!(status, reqwest::StatusCode::NOT_FOUND),
            other => panic!("expected a status error, got {:?}", other),
        }
        assert!(!managed.exists());
        assert!(!partial.exists());
        assert_eq!(manager.executable().await, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_writes_executable_binary() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = isolated_config(tmp.path());
        config.release_base_url = release_server().await;
        config.release = "good".to_string();
        let managed = config.managed_path();

        let manager = ToolManager::new(config, local_client());
        assert_eq!(manager.executable().await, Some(managed.clone()));
        assert!(is_executable(&managed));
        assert!(!managed.with_extension("part").exists());
        assert_eq!(std::fs::read_to_string(&managed).unwrap(), "#!/bin/sh\necho 2025.01.26\n");
    }
}
