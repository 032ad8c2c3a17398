//! Health check infrastructure for the installer
//!
//! Provides the readiness flag shared between the install loop and the
//! HTTP probe handlers, and the router serving Kubernetes liveness and
//! readiness probes.

use crate::observability::InstallerMetrics;
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Probe paths
pub mod endpoints {
    pub const LIVENESS: &str = "/healthz";
    pub const READINESS: &str = "/readyz";
    pub const METRICS: &str = "/metrics";
}

/// Default port for the probe server
pub const DEFAULT_HEALTH_PORT: u16 = 8000;

/// Readiness of the installed CNI configuration
///
/// A single atomically updated boolean; clones share the same cell. The
/// install loop is the only writer, probe handlers only read.
#[derive(Debug, Clone, Default)]
pub struct ReadinessFlag {
    ready: Arc<AtomicBool>,
}

impl ReadinessFlag {
    /// Create a flag in the not-ready state
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        InstallerMetrics::new().set_ready(true);
    }

    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
        InstallerMetrics::new().set_ready(false);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Readiness response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Liveness: the process is up
async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// Readiness: 200 while the installed configuration is verified, else 503
async fn readyz(State(flag): State<ReadinessFlag>) -> impl IntoResponse {
    if flag.is_ready() {
        (
            StatusCode::OK,
            Json(ReadinessResponse {
                ready: true,
                reason: None,
            }),
        )
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ReadinessResponse {
                ready: false,
                reason: Some("CNI configuration not installed or not verified".to_string()),
            }),
        )
    }
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the probe router
pub fn create_router(flag: ReadinessFlag) -> Router {
    Router::new()
        .route(endpoints::LIVENESS, get(healthz))
        .route(endpoints::READINESS, get(readyz))
        .route(endpoints::METRICS, get(metrics))
        .with_state(flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_not_ready_initially() {
        let flag = ReadinessFlag::new();
        assert!(!flag.is_ready());
    }

    #[test]
    fn test_readiness_clones_share_state() {
        let flag = ReadinessFlag::new();
        let probe_view = flag.clone();

        flag.set_ready();
        assert!(probe_view.is_ready());

        flag.set_not_ready();
        assert!(!probe_view.is_ready());
    }

    #[tokio::test]
    async fn test_readiness_visible_across_threads() {
        let flag = ReadinessFlag::new();
        let writer = flag.clone();

        tokio::spawn(async move { writer.set_ready() })
            .await
            .unwrap();

        assert!(flag.is_ready());
    }
}
