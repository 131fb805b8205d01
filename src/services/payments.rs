//! Ingress payment service: idempotent intent creation.
//!
//! Dedup order is cache, then store, then insert. The insert and its
//! `payment.created` outbox row commit in one transaction, so either the
//! intent exists and its event will be published, or neither happened.

use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, SqlErr,
    TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::cache::KvStore;
use crate::entities::payment;
use crate::errors::ServiceError;
use crate::events::{self, PaymentCreatedEvent, TOPIC_PAYMENT_CREATED};
use crate::metrics::Metrics;

const IDEMPOTENCY_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Status values the gateway writes.
pub const STATUS_NEW: &str = "NEW";
pub const STATUS_CONFIRMED: &str = "CONFIRMED";

#[derive(Debug, Clone, serde::Deserialize, Validate)]
pub struct CreatePaymentRequest {
    pub amount: rust_decimal::Decimal,

    #[validate(length(equal = 3, message = "currency must be a 3-letter code"))]
    pub currency: String,

    #[validate(length(min = 1, message = "customer_id is required"))]
    pub customer_id: String,

    #[validate(length(min = 1, message = "merchant_id is required"))]
    pub merchant_id: String,
}

pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    kv: Arc<dyn KvStore>,
    outbox_notify: Arc<Notify>,
    metrics: Arc<Metrics>,
}

impl PaymentService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        kv: Arc<dyn KvStore>,
        outbox_notify: Arc<Notify>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            kv,
            outbox_notify,
            metrics,
        }
    }

    /// Accepts a payment intent at most once per idempotency key.
    ///
    /// Returns the intent and whether it was a replay of an earlier
    /// submission.
    #[instrument(skip(self, request))]
    pub async fn create_payment(
        &self,
        idempotency_key: &str,
        request: CreatePaymentRequest,
    ) -> Result<(payment::Model, bool), ServiceError> {
        request.validate()?;
        if request.amount.is_sign_negative() {
            return Err(ServiceError::Validation(
                "amount must not be negative".to_string(),
            ));
        }
        if request.amount.scale() > 2 {
            return Err(ServiceError::Validation(
                "amount supports at most two fractional digits".to_string(),
            ));
        }

        let cache_key = format!("idempotency:{idempotency_key}");
        match self.kv.get(&cache_key).await {
            Ok(Some(cached)) => match serde_json::from_str::<payment::Model>(&cached) {
                Ok(model) => {
                    self.metrics.payments_replayed.inc();
                    return Ok((model, true));
                }
                Err(e) => warn!("dropping unreadable idempotency cache entry: {e}"),
            },
            Ok(None) => {}
            Err(e) => warn!("idempotency cache unavailable, falling back to store: {e}"),
        }

        if let Some(existing) = payment::Entity::find()
            .filter(payment::Column::IdempotencyKey.eq(idempotency_key))
            .one(&*self.db)
            .await?
        {
            self.cache_intent(&cache_key, &existing).await;
            self.metrics.payments_replayed.inc();
            return Ok((existing, true));
        }

        let now = Utc::now();
        let model = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            amount: Set(request.amount),
            currency: Set(request.currency.to_uppercase()),
            customer_id: Set(request.customer_id),
            merchant_id: Set(request.merchant_id),
            status: Set(STATUS_NEW.to_string()),
            idempotency_key: Set(idempotency_key.to_string()),
            created_at: Set(now),
            updated_at: Set(now),
        };

        let txn = self.db.begin().await?;
        let inserted = match model.insert(&txn).await {
            Ok(inserted) => inserted,
            Err(e) if matches!(e.sql_err(), Some(SqlErr::UniqueConstraintViolation(_))) => {
                // Lost a same-key race; the winner's row is the answer.
                txn.rollback().await?;
                let existing = payment::Entity::find()
                    .filter(payment::Column::IdempotencyKey.eq(idempotency_key))
                    .one(&*self.db)
                    .await?
                    .ok_or_else(|| {
                        ServiceError::Internal(
                            "idempotency key vanished after unique violation".to_string(),
                        )
                    })?;
                self.cache_intent(&cache_key, &existing).await;
                self.metrics.payments_replayed.inc();
                return Ok((existing, true));
            }
            Err(e) => return Err(e.into()),
        };

        let event = PaymentCreatedEvent {
            payment_id: inserted.id,
            amount: inserted.amount,
            currency: inserted.currency.clone(),
            customer_id: inserted.customer_id.clone(),
            merchant_id: inserted.merchant_id.clone(),
            status: inserted.status.clone(),
            created_at: inserted.created_at,
        };
        events::outbox::enqueue(
            &txn,
            TOPIC_PAYMENT_CREATED,
            &inserted.id.to_string(),
            serde_json::to_value(&event)?,
        )
        .await?;
        txn.commit().await?;

        self.cache_intent(&cache_key, &inserted).await;
        self.outbox_notify.notify_one();
        self.metrics.payments_created.inc();
        info!(
            payment_id = %inserted.id,
            customer_id = %inserted.customer_id,
            amount = %inserted.amount,
            "payment intent created"
        );

        Ok((inserted, false))
    }

    pub async fn get_payment(&self, id: Uuid) -> Result<payment::Model, ServiceError> {
        payment::Entity::find_by_id(id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment {id} not found")))
    }

    /// Administrative confirm; outside the lifecycle core.
    pub async fn confirm_payment(&self, id: Uuid) -> Result<(), ServiceError> {
        let result = payment::Entity::update_many()
            .col_expr(
                payment::Column::Status,
                sea_orm::sea_query::Expr::value(STATUS_CONFIRMED),
            )
            .col_expr(
                payment::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(payment::Column::Id.eq(id))
            .exec(&*self.db)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::NotFound(format!("payment {id} not found")));
        }
        info!(payment_id = %id, "payment confirmed");
        Ok(())
    }

    /// Cache failures only cost a store lookup on the next retry.
    async fn cache_intent(&self, cache_key: &str, model: &payment::Model) {
        let encoded = match serde_json::to_string(model) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("failed encoding intent for cache: {e}");
                return;
            }
        };
        if let Err(e) = self
            .kv
            .set(cache_key, &encoded, Some(IDEMPOTENCY_CACHE_TTL))
            .await
        {
            warn!("failed caching intent: {e}");
        }
    }
}
