use std::sync::Arc;

use media_relay::{
    api::{self, AppState},
    config::RelayConfig,
    error::ApiError,
    relay::DownloadRelay,
    store::TokenStore,
    sweeper,
    ytdlp::YtDlp,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "media_relay=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {}", error.message);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ApiError> {
    let config = RelayConfig::from_env();
    info!(
        ttl_secs = config.token_ttl.as_secs(),
        sweep_secs = config.sweep_interval.as_secs(),
        yt_dlp = ?config.yt_dlp_command,
        "starting media relay"
    );

    let store = Arc::new(TokenStore::new(
        config.token_ttl,
        config.tombstone_retention,
    ));
    let source = Arc::new(YtDlp::from_config(&config));
    let relay = DownloadRelay::new(Arc::clone(&store), source, config.stream_buffer_chunks);

    let shutdown = CancellationToken::new();
    let sweeper = sweeper::spawn(Arc::clone(&store), config.sweep_interval, shutdown.clone());

    let cors = api::build_cors_layer(&config.allowed_origins)?;
    let app = api::router(AppState::new(relay))
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.bind_addr).await.map_err(|error| {
        ApiError::internal(format!("Could not bind {}: {error}", config.bind_addr))
    })?;
    info!("Relay listening on http://{}", config.bind_addr);

    tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));
    let served = api::serve(listener, app, shutdown.clone(), config.shutdown_grace)
        .await
        .map_err(|error| ApiError::internal(format!("HTTP server error: {error}")));

    // stop the sweeper before the store goes away
    shutdown.cancel();
    if let Err(error) = sweeper.await {
        warn!("token sweeper ended abnormally: {error}");
    }
    drop(store);

    served
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => {
                info!("shutting down");
                shutdown.cancel();
            }
            Err(error) => warn!("could not listen for ctrl-c: {error}"),
        },
        _ = shutdown.cancelled() => {}
    }
}
