//! Prometheus metrics HTTP endpoint
//!
//! Provides /metrics endpoint for Prometheus scraping.

use std::net::SocketAddr;

use axum::{
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use prometheus::{Encoder, TextEncoder};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::common::Result;
use crate::error::Error;
use crate::shutdown::Coordinator;

use super::metrics::REGISTRY;

/// Prometheus metrics endpoint
async fn get_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(CONTENT_TYPE, "text/plain; charset=utf-8")],
            e.to_string().into_bytes(),
        ),
    }
}

/// Build the API router (metrics only)
pub fn build_api_router() -> Router {
    Router::new().route("/metrics", get(get_metrics))
}

/// Bind and start the metrics server.
///
/// The server counts as outstanding work until it has stopped, and stops
/// when the coordinator's token fires.
pub async fn start_api_server(
    listen: &str,
    coordinator: &Coordinator,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| Error::Config(format!("Failed to bind metrics server to {}: {}", listen, e)))?;
    let addr = listener.local_addr()?;

    info!("Prometheus metrics server listening on http://{}/metrics", addr);

    let token = coordinator.token();
    let work = coordinator.work_guard();
    let app = build_api_router();

    let handle = tokio::spawn(async move {
        let _work = work;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                token.cancelled().await;
                info!("Metrics server shutting down");
            })
            .await
            .unwrap_or_else(|e| {
                warn!("Metrics server error: {}", e);
            });
    });

    Ok((addr, handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::metrics::{init_metrics, CONNECTIONS_TOTAL};
    use crate::shutdown::DrainOutcome;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_metrics_endpoint_and_shutdown() {
        init_metrics();
        CONNECTIONS_TOTAL.with_label_values(&["http"]).inc();

        let coordinator = Coordinator::default();
        let (addr, handle) = start_api_server("127.0.0.1:0", &coordinator).await.unwrap();
        assert_eq!(coordinator.outstanding(), 1);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8_lossy(&response);

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("twinproxy_connections_total"));

        assert_eq!(coordinator.await_shutdown_complete().await, DrainOutcome::Clean);
        handle.await.unwrap();
        assert_eq!(coordinator.outstanding(), 0);
    }
}
