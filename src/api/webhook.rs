//! Webhook intake for the external similarity service
//!
//! Only the two known event types are accepted, and the request body
//! must carry a hex HMAC-SHA256 signature over the exact raw bytes.
//! Anything else is a 403. Accepted deliveries are answered immediately
//! and dispatched to the Reconciler on a spawned task afterwards, so the
//! service never blocks the caller on wiki or database work.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::debug;

use crate::services::similarity_client::{WEBHOOK_EVENT_TYPES, WEBHOOK_PATH};

use super::AppState;

const EVENT_TYPE_HEADER: &str = "X-Event-Type";
const SIGNATURE_HEADER: &str = "X-Signature";

type HmacSha256 = Hmac<Sha256>;

/// Verify a hex HMAC-SHA256 signature over the raw body.
fn signature_valid(secret: &[u8], body: &[u8], provided_hex: &str) -> bool {
    let Ok(provided) = hex::decode(provided_hex) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&provided).is_ok()
}

/// POST /tca-webhook
pub async fn tca_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event_type = match headers
        .get(EVENT_TYPE_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|t| WEBHOOK_EVENT_TYPES.contains(t))
    {
        Some(event_type) => event_type.to_string(),
        None => return StatusCode::FORBIDDEN.into_response(),
    };

    let Some(secret) = state.webhook_secret.as_deref() else {
        return StatusCode::FORBIDDEN.into_response();
    };
    let authentic = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|sig| signature_valid(secret, &body, sig))
        .unwrap_or(false);
    if !authentic {
        return StatusCode::FORBIDDEN.into_response();
    }

    // respond first; the dispatch runs after on its own task
    match serde_json::from_slice::<Value>(&body) {
        Ok(payload) => {
            let reconciler = state.reconciler.clone();
            tokio::spawn(async move {
                reconciler.dispatch_webhook(&event_type, payload).await;
            });
        }
        Err(e) => debug!(%e, "accepted webhook with unparsable body"),
    }

    (StatusCode::OK, Json(json!({"msg": "accepted"}))).into_response()
}

pub fn routes() -> Router<AppState> {
    Router::new().route(WEBHOOK_PATH, post(tca_webhook))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_verification_matches_hex_hmac() {
        let secret = b"hunter2";
        let body = br#"{"id":"abc"}"#;
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        let valid = hex::encode(mac.finalize().into_bytes());

        assert!(signature_valid(secret, body, &valid));
        assert!(!signature_valid(secret, body, "deadbeef"));
        assert!(!signature_valid(secret, body, "not hex at all"));
        assert!(!signature_valid(b"other secret", body, &valid));
    }
}
