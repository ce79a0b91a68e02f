use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use flowbridge_api::app::{self, AppServices};
use flowbridge_infra::config::BridgeConfig;
use flowbridge_infra::workers::shutdown_all;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    flowbridge_observability::init();

    let config = BridgeConfig::from_env().context("invalid configuration")?;
    let services = Arc::new(AppServices::from_config(&config)?);

    let token = CancellationToken::new();
    let workers = services.start_workers(&config, &token)?;

    let listener = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.http_addr))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");

    let shutdown = token.clone();
    axum::serve(listener, app::build_app(services))
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("shutdown requested"),
                _ = shutdown.cancelled() => {}
            }
            shutdown.cancel();
        })
        .await
        .context("http server failed")?;

    token.cancel();
    let aborted = shutdown_all(workers, config.shutdown_grace).await;
    tracing::info!(aborted, "shutdown complete");
    Ok(())
}
