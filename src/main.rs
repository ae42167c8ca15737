use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use shorts_relay::{
    api::{AppState, build_router},
    config::AppConfig,
    extractor::YtDlpExtractor,
};
use tokio::net::TcpListener;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "shorts_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env();

    if let Some(cookies) = config.credential.cookies_file() {
        if cookies.exists() {
            info!("Using upstream cookies from {}", cookies.display());
        } else {
            warn!(
                "YTDLP_COOKIES points at {}, which does not exist yet",
                cookies.display()
            );
        }
    }

    let extractor = Arc::new(YtDlpExtractor::new(config.ytdlp_bin.clone(), config.info_timeout));
    let state = AppState::new(&config, extractor);
    let app = build_router(&config, state)?;

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("could not bind {}", config.bind_addr))?;

    info!("Server running on http://{}", config.bind_addr);
    info!("Serving static files from {}", config.static_dir.display());

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("HTTP server error")
}
