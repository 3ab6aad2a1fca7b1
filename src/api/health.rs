use axum::Json;
use serde_json::{json, Value};

/// Liveness probe. Does not touch the database or any gateway.
pub async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
