use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use redub_core::Config;
use redub_engine::stage::fake::FakeStage;
use redub_server::{build_router, lifecycle};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let bind_addr = config.bind_addr;

    // Stage collaborators (ASR, translation, TTS, mixing, muxing) are
    // linked by the deployment; the deterministic built-in pipeline
    // stands in so the orchestration core runs end to end without them.
    let pipeline = FakeStage::standard_pipeline();

    let lifecycle = lifecycle::boot(config, pipeline).await?;
    let router = build_router(lifecycle.state.clone());

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "listening");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("serving")?;

    lifecycle.shutdown(Duration::from_secs(30)).await;
    Ok(())
}

/// Resolves on SIGTERM or ctrl-c; cancellation noise is expected and
/// absorbed here.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}
