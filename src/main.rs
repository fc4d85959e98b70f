use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use stickerpress::sticker_core::encoder_available;
use stickerpress::{Engine, ServerConfig, router};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::parse();

    if !encoder_available() {
        error!("FFmpeg not found. Install FFmpeg and add it to your PATH.");
        std::process::exit(1);
    }
    info!("FFmpeg check passed");

    let engine = Arc::new(Engine::new(&config).context("failed to initialize engine")?);
    let app = router(engine);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("control plane listening on {addr}");
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
