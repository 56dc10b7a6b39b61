//! HTTP front door: health check and webhook intake

pub mod health;
pub mod webhook;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

use crate::services::reconciler::Reconciler;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub reconciler: Arc<Reconciler>,
    /// Shared secret for webhook signatures; `None` rejects all webhooks.
    pub webhook_secret: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(
        pool: SqlitePool,
        reconciler: Arc<Reconciler>,
        webhook_secret: Option<Vec<u8>>,
    ) -> Self {
        Self {
            pool,
            reconciler,
            webhook_secret,
        }
    }
}

async fn root() -> Json<Value> {
    Json(json!({}))
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .merge(health::routes())
        .merge(webhook::routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
