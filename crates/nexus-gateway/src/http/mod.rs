pub mod health;
pub mod messages;
pub mod tokens;

use axum::Json;
use nexus_core::error::ProxyError;
use serde_json::{json, Value};

/// Error envelope mirroring the upstream shape (spec §6): `{error: {type, message, request_id}}`.
pub(crate) fn error_envelope(err: &ProxyError, request_id: &str) -> Json<Value> {
    Json(json!({
        "error": {
            "type": err.code(),
            "message": err.to_string(),
            "request_id": request_id,
        }
    }))
}
