use std::sync::PoisonError;

use axum::response::{IntoResponse, Response};
use http::{StatusCode, header};
use prometheus_client::encoding::text::encode;
use tracing::error;
use xdeploy_controller::REGISTRY;

const OPENMETRICS: &str = "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Renders the shared registry in the OpenMetrics text format
pub(super) async fn export() -> Response {
    let mut body = String::new();
    let registry = REGISTRY.read().unwrap_or_else(PoisonError::into_inner);
    if let Err(e) = encode(&mut body, &registry) {
        error!(%e, "failed to encode metrics");
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    ([(header::CONTENT_TYPE, OPENMETRICS)], body).into_response()
}
