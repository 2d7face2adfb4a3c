//! Logging initialization and the metrics/probe HTTP server.
//!
//! Logging goes through a `tracing-subscriber` registry with an `EnvFilter`
//! (`RUST_LOG`, default `info,bulwark=debug`) and a fmt layer. When enabled,
//! an axum server exposes Prometheus metrics and liveness/readiness probes.

use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("Failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Failed to bind metrics port: {0}")]
    MetricsPort(#[from] std::io::Error),
}

/// Configuration for telemetry.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line.
    pub service_name: String,
    /// Enable Prometheus metrics endpoint.
    pub prometheus_enabled: bool,
    /// Prometheus metrics port.
    pub prometheus_port: u16,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "bulwark-replica".to_string(),
            prometheus_enabled: false,
            prometheus_port: 9090,
        }
    }
}

/// Initialize logging and, if configured, the metrics server.
///
/// Must be called from within a tokio runtime when metrics are enabled.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bulwark=debug"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    let subscriber = Registry::default().with(env_filter).with(fmt_layer);
    tracing::subscriber::set_global_default(subscriber)?;

    tracing::info!(
        service = %config.service_name,
        version = env!("CARGO_PKG_VERSION"),
        "Telemetry initialized"
    );

    let (prometheus_handle, ready_flag) = if config.prometheus_enabled {
        let ready_flag = Arc::new(AtomicBool::new(false));
        let handle = start_metrics_server(config.prometheus_port, ready_flag.clone());
        (Some(handle), Some(ready_flag))
    } else {
        (None, None)
    };

    Ok(TelemetryGuard {
        prometheus_handle,
        ready_flag,
    })
}

/// Owns the metrics server task; aborts it on drop.
pub struct TelemetryGuard {
    prometheus_handle: Option<tokio::task::JoinHandle<()>>,
    ready_flag: Option<Arc<AtomicBool>>,
}

impl TelemetryGuard {
    /// Stop the metrics server.
    pub async fn shutdown(mut self) {
        if let Some(handle) = self.prometheus_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Mark the replica as ready (for the readiness probe).
    ///
    /// The replica flips this itself when it is handed the flag via
    /// [`TelemetryGuard::ready_flag`]: false while recovering, true otherwise.
    pub fn set_ready(&self, ready: bool) {
        if let Some(flag) = &self.ready_flag {
            flag.store(ready, Ordering::SeqCst);
        }
    }

    /// The flag behind `/ready`, if the metrics server is running.
    pub fn ready_flag(&self) -> Option<Arc<AtomicBool>> {
        self.ready_flag.clone()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.prometheus_handle.take() {
            handle.abort();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Prometheus HTTP Server
// ═══════════════════════════════════════════════════════════════════════════

fn router(ready_flag: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler))
        .route("/ready", get(move || ready_handler(ready_flag.clone())))
}

/// Start the metrics HTTP server.
///
/// Exposes:
/// - `GET /metrics` - Prometheus metrics in text format
/// - `GET /health` - Liveness probe (always returns 200 if server is running)
/// - `GET /ready` - Readiness probe (200 outside recovery, 503 otherwise)
fn start_metrics_server(port: u16, ready_flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(ready_flag);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!(port, "Starting metrics server on http://{}", addr);

        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(error = ?e, port, "Failed to bind metrics server");
                return;
            }
        };

        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = ?e, "Metrics server error");
        }
    })
}

async fn metrics_handler() -> impl IntoResponse {
    // Make sure the bulwark families exist even before the first event.
    let _ = crate::metrics::metrics();

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = ?e, "Failed to encode metrics");
        return (
            axum::http::StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }

    (
        [(
            axum::http::header::CONTENT_TYPE,
            encoder.format_type().to_string(),
        )],
        buffer,
    )
        .into_response()
}

async fn health_handler() -> impl IntoResponse {
    axum::Json(HealthResponse { status: "ok" })
}

async fn ready_handler(ready_flag: Arc<AtomicBool>) -> impl IntoResponse {
    if ready_flag.load(Ordering::SeqCst) {
        (
            axum::http::StatusCode::OK,
            axum::Json(ReadyResponse {
                status: "ready",
                ready: true,
            }),
        )
    } else {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(ReadyResponse {
                status: "recovering",
                ready: false,
            }),
        )
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    ready: bool,
}
