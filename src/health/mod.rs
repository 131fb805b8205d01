//! Liveness and readiness endpoints shared by all four binaries.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use sea_orm::DatabaseConnection;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

#[derive(Clone)]
pub struct HealthState {
    pub db: Arc<DatabaseConnection>,
    pub service: &'static str,
    pub started_at: Instant,
}

impl HealthState {
    pub fn new(db: Arc<DatabaseConnection>, service: &'static str) -> Self {
        Self {
            db,
            service,
            started_at: Instant::now(),
        }
    }
}

pub fn routes(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check))
        .with_state(state)
}

async fn health_check(State(state): State<HealthState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": state.service,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// Readiness includes a store round-trip; a service that cannot reach
/// its database should be pulled from rotation.
async fn readiness_check(State(state): State<HealthState>) -> impl IntoResponse {
    match state.db.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "status": "ready", "service": state.service })),
        ),
        Err(e) => {
            error!("readiness store ping failed: {e}");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({ "status": "unavailable", "service": state.service })),
            )
        }
    }
}
