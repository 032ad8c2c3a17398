//! HTTP server for health probes and Prometheus metrics

use cni_lib::health::{create_router, ReadinessFlag};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve the probe router until `shutdown` is cancelled
pub async fn serve(
    port: u16,
    ready: ReadinessFlag,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = create_router(ready);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}
