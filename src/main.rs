use tracing_subscriber::EnvFilter;

use youtube_downloader_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("youtube_downloader_server=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;
    youtube_downloader_server::run(config).await
}
