//! Fraud evaluator query routes.

use axum::{extract::State, response::Json, routing::get, Router};
use std::sync::Arc;

use crate::errors::ServiceError;
use crate::services::fraud::{FraudService, FraudStats};

#[derive(Clone)]
pub struct FraudApiState {
    pub fraud: Arc<FraudService>,
}

pub fn routes(state: FraudApiState) -> Router {
    Router::new()
        .route("/fraud/stats", get(get_stats))
        .with_state(state)
}

async fn get_stats(
    State(state): State<FraudApiState>,
) -> Result<Json<FraudStats>, ServiceError> {
    Ok(Json(state.fraud.stats().await?))
}
