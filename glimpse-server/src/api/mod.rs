//! API routes and handlers

mod analyze;
mod generate;
mod health;
mod models;

use std::time::Duration;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderMap,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;

/// Optional per-request deadline in milliseconds. It can only shorten the
/// server's own timeout.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";

// Room for multipart framing and the other form fields.
const BODY_OVERHEAD: usize = 1024 * 1024;

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    let max_image_bytes = state.governor.limits().max_image_bytes;
    // base64 in a JSON body inflates the image by a third
    let body_limit = max_image_bytes
        .saturating_add(max_image_bytes / 3)
        .saturating_add(BODY_OVERHEAD);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/models", get(models::list_models))
        .route("/analyze", post(analyze::analyze))
        .route("/caption", post(analyze::analyze))
        .route("/generate", post(generate::generate))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

fn caller_deadline(headers: &HeaderMap) -> Result<Option<Duration>, ApiError> {
    let Some(value) = headers.get(REQUEST_TIMEOUT_HEADER) else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(|ms| Some(Duration::from_millis(ms)))
        .ok_or_else(|| {
            ApiError::bad_request(format!(
                "header '{REQUEST_TIMEOUT_HEADER}' must be a positive number of milliseconds"
            ))
        })
}

/// Treats empty form values and JSON strings as absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests;
