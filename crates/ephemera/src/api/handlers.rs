//! HTTP request handlers.

use axum::Json;
use serde_json::{Value, json};

/// Liveness probe. No authentication, no relay state.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
