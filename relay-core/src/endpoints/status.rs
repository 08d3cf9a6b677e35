//! Liveness and build-info endpoints.

use axum::Json;
use serde_json::{json, Value};

#[expect(clippy::unused_async)]
pub async fn health_handler() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

#[expect(clippy::unused_async)]
pub async fn status_handler() -> Json<Value> {
    Json(json!({
        "name": "relay-gateway",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
