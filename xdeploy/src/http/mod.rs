mod health;
mod metrics;

use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;

/// Serves `/metrics` and `/readyz` until `cancel` fires. `/readyz` turns
/// healthy once `ready` is cancelled.
pub async fn serve_metrics(
    addr: SocketAddr,
    ready: CancellationToken,
    cancel: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "serving metrics");

    axum::serve(listener, router(ready))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("metrics server stopped");
    Ok(())
}

fn router(ready: CancellationToken) -> Router {
    Router::new()
        .route("/metrics", get(metrics::export))
        .route("/readyz", get(health::readyz))
        .with_state(ready)
}
