//! Ledger query routes.

use axum::{
    extract::{Path, State},
    response::Json,
    routing::get,
    Router,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::{account, ledger_entry};
use crate::errors::ServiceError;
use crate::services::ledger::LedgerService;

#[derive(Clone)]
pub struct LedgerApiState {
    pub ledger: Arc<LedgerService>,
}

pub fn routes(state: LedgerApiState) -> Router {
    Router::new()
        .route("/accounts/:id/balance", get(get_account_balance))
        .route("/accounts/:id/entries", get(get_account_entries))
        .route("/payments/:id/entries", get(get_payment_entries))
        .with_state(state)
}

async fn get_account_balance(
    State(state): State<LedgerApiState>,
    Path(id): Path<String>,
) -> Result<Json<account::Model>, ServiceError> {
    Ok(Json(state.ledger.account_balance(&id).await?))
}

async fn get_account_entries(
    State(state): State<LedgerApiState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<ledger_entry::Model>>, ServiceError> {
    Ok(Json(state.ledger.account_entries(&id).await?))
}

async fn get_payment_entries(
    State(state): State<LedgerApiState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ledger_entry::Model>>, ServiceError> {
    Ok(Json(state.ledger.payment_entries(id).await?))
}
