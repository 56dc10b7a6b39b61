//! Health check endpoint

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::error;

use crate::db::queries::{self, StatusWindow};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct SectionStats {
    pub length: i64,
    pub newest: Option<String>,
    pub oldest: Option<String>,
}

impl From<StatusWindow> for SectionStats {
    fn from(window: StatusWindow) -> Self {
        Self {
            length: window.length,
            newest: window.newest.map(|t| t.to_rfc3339()),
            oldest: window.oldest.map(|t| t.to_rfc3339()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub queue: SectionStats,
    pub ready: SectionStats,
    pub status: String,
}

/// GET /healthz
///
/// Reports the size and age window of the candidate queue and of the
/// confirmed matches still awaiting remediation.
pub async fn healthz(State(state): State<AppState>) -> Result<Json<HealthResponse>, StatusCode> {
    let queue = queries::queue_stats(&state.pool).await.map_err(|e| {
        error!(%e, "queue stats failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let ready = queries::ready_stats(&state.pool).await.map_err(|e| {
        error!(%e, "ready stats failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(HealthResponse {
        queue: queue.into(),
        ready: ready.into(),
        status: "up".to_string(),
    }))
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/healthz", get(healthz))
}
