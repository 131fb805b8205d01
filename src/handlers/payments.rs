//! Ingress gateway routes.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

use crate::entities::payment;
use crate::errors::ServiceError;
use crate::services::payments::{CreatePaymentRequest, PaymentService};

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct GatewayState {
    pub payments: Arc<PaymentService>,
}

pub fn routes(state: GatewayState) -> Router {
    Router::new()
        .route("/payments", post(create_payment))
        .route("/payments/:id", get(get_payment))
        .route("/payments/:id/confirm", post(confirm_payment))
        .with_state(state)
}

/// 201 on first acceptance, 200 with the identical body on replays.
///
/// The body is taken as raw JSON so a missing or mistyped field surfaces
/// as a 400 validation error rather than an extractor rejection.
async fn create_payment(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<payment::Model>), ServiceError> {
    let idempotency_key = headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or(ServiceError::MissingIdempotencyKey)?;

    let request: CreatePaymentRequest = serde_json::from_value(body)
        .map_err(|e| ServiceError::Validation(format!("invalid payment request: {e}")))?;

    let (intent, replayed) = state.payments.create_payment(idempotency_key, request).await?;
    let status = if replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(intent)))
}

async fn get_payment(
    State(state): State<GatewayState>,
    Path(id): Path<Uuid>,
) -> Result<Json<payment::Model>, ServiceError> {
    Ok(Json(state.payments.get_payment(id).await?))
}

async fn confirm_payment(
    State(state): State<GatewayState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state.payments.confirm_payment(id).await?;
    Ok(Json(json!({ "status": "confirmed", "payment_id": id })))
}
