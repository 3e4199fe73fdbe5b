pub mod config;
pub mod downloader;
pub mod server;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing::{info, warn};

use crate::config::Config;
use crate::downloader::backends::YtDlpSettings;
use crate::downloader::{Fetcher, StorageManager, ToolConfig, ToolManager};
use crate::server::AppState;

/// Resolve storage, start yt-dlp provisioning and serve until Ctrl+C
pub async fn run(config: Config) -> anyhow::Result<()> {
    let storage = Arc::new(StorageManager::resolve(&config.downloads_dir, config.temp_cleanup_delay));
    info!(
        downloads = %storage.downloads_dir().display(),
        fallback = storage.using_fallback(),
        writable = storage.is_writable(),
        "storage ready"
    );

    let client = build_client(&config)?;

    let tools = Arc::new(ToolManager::new(
        ToolConfig::new(
            config.ytdlp_path.clone(),
            config.ytdlp_bin_dir.clone(),
            config.ytdlp_release.clone(),
        ),
        client.clone(),
    ));
    // Provision in the background; yt-dlp backends await the same cell
    let warmup = tools.clone();
    tokio::spawn(async move {
        let _ = warmup.executable().await;
    });

    let settings = YtDlpSettings {
        proxy: config.proxy.clone(),
        cookies: config.cookies.clone(),
        metadata_timeout_secs: config.metadata_timeout_secs,
        download_timeout_secs: config.download_timeout_secs,
    };
    let fetcher = Arc::new(
        Fetcher::standard(client, tools.clone(), storage.clone(), settings)
            .with_first_byte_timeout(Duration::from_secs(config.first_byte_timeout_secs)),
    );

    let app = server::router(AppState { fetcher, storage, tools });

    let addr = config.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("shut down");
    Ok(())
}

fn build_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(config.metadata_timeout_secs));
    if let Some(proxy) = &config.proxy {
        let proxy = reqwest::Proxy::all(proxy).with_context(|| format!("Invalid proxy URL {}", proxy))?;
        builder = builder.proxy(proxy);
    }
    builder.build().context("Failed to build HTTP client")
}

async fn shutdown_signal() {
    // Only graceful shutdown depends on this; Ctrl+C still terminates the process
    if let Err(e) = signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler");
    }
}
