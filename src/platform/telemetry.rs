//! Prometheus scrape endpoint.
//!
//! Serves every metric the process registered: shipper and ingest counters,
//! queue depth, flush and evaluation cycle histograms, probe totals. One
//! plain text route; scrapers poll it, nothing is pushed.

use std::net::SocketAddr;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::platform::config::ObservabilitySettings;

/// Serves `/metrics` until cancellation. A no-op when metrics are disabled
/// in the observability settings.
pub async fn serve_metrics(
    settings: ObservabilitySettings,
    token: CancellationToken,
) -> Result<()> {
    if !settings.enable_metrics {
        return Ok(());
    }

    let app = Router::new().route("/metrics", get(render_metrics));
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics_port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(port = settings.metrics_port, "metrics exporter listening for scrapes");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            info!("metrics exporter draining");
        })
        .await?;

    Ok(())
}

/// Encodes the default registry in the Prometheus text format.
async fn render_metrics() -> String {
    let families = prometheus::gather();
    let mut out = Vec::new();
    if TextEncoder::new().encode(&families, &mut out).is_err() {
        return String::new();
    }
    String::from_utf8(out).unwrap_or_default()
}
