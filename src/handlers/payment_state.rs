//! Orchestrator query routes.

use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::services::orchestrator::OrchestratorService;

#[derive(Clone)]
pub struct StateApiState {
    pub orchestrator: Arc<OrchestratorService>,
}

pub fn routes(state: StateApiState) -> Router {
    Router::new()
        .route("/payments/:id/state", get(get_payment_state))
        .with_state(state)
}

async fn get_payment_state(
    State(state): State<StateApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    let row = state.orchestrator.get_state(id).await?;
    Ok(Json(json!({
        "payment_id": row.payment_id,
        "state": row.state,
        "previous_state": row.previous_state,
        "fraud_decision": row.fraud_decision,
        "amount": row.amount,
        "currency": row.currency,
        "created_at": row.created_at,
        "updated_at": row.updated_at,
    })))
}
