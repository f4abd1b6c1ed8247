//! Prometheus metrics endpoint

use axum::{
    Router,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus::{Encoder, TextEncoder};
use std::time::Instant;

use crate::metrics::{APP_UPTIME_SECONDS, REGISTRY};

/// Metrics endpoint handler
///
/// Refreshes the uptime gauge, then returns all metrics in Prometheus text
/// format.
async fn metrics_handler(started_at: Instant) -> Response {
    APP_UPTIME_SECONDS.set(started_at.elapsed().as_secs_f64());

    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics_text) => (
            axum::http::StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, encoder.format_type())],
            metrics_text,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics",
            )
                .into_response()
        }
    }
}

/// Create metrics router exposing `/metrics`
pub fn metrics_router<S>(started_at: Instant) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    Router::new().route("/metrics", get(move || metrics_handler(started_at)))
}
