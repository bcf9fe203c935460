//! Probe and metrics endpoints.

use crate::error::ControllerError;
use crate::metrics::PrometheusMetrics;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Health check response.
#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub fn build_router(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(metrics)
}

/// Serves the router until the listener fails.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub async fn run_server(metrics: Arc<PrometheusMetrics>, addr: SocketAddr) -> Result<(), ControllerError> {
    let app = build_router(metrics);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics server listening on {addr}");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> Response {
    match metrics.render() {
        Ok(body) => (StatusCode::OK, [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!("Failed to render metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reconcile_engine::{DecisionOutcome, MetricsSink};

    async fn body_of(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_handler() {
        let response = health_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_of(response).await.contains("\"status\":\"healthy\""));
    }

    #[tokio::test]
    async fn test_metrics_handler_serves_text_format() {
        let metrics = Arc::new(PrometheusMetrics::new().unwrap());
        metrics.decision("prod", DecisionOutcome::NoOp);

        let response = metrics_handler(State(metrics)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], prometheus::TEXT_FORMAT);
        assert!(body_of(response).await.contains("fleet_decisions_total{cluster=\"prod\",outcome=\"noop\"} 1"));
    }
}
