//! Payment lifecycle orchestrator.
//!
//! Consumes `payment.created`, drives each payment through the state
//! machine, and consults the fraud evaluator synchronously. Correctness
//! rests on guarded compare-and-swap updates of the state row; the
//! advisory lock only collapses duplicate work inside its TTL window.

use chrono::Utc;
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cache::KvStore;
use crate::domain::{FraudVerdict, PaymentState};
use crate::entities::payment_state;
use crate::errors::ServiceError;
use crate::events::{
    self, dead_letter_topic, FraudCheckReply, FraudCheckRequest, PaymentCreatedEvent,
    PaymentStateChangedEvent, SUBJECT_FRAUD_CHECK, TOPIC_PAYMENT_CREATED,
    TOPIC_PAYMENT_STATE_CHANGED,
};
use crate::message_bus::RequestBus;
use crate::message_log::{EventLog, LogRecord};
use crate::metrics::Metrics;

/// Intent snapshot threaded through transitions so every emitted event
/// carries the payment's real figures.
#[derive(Debug, Clone)]
struct PaymentFacts {
    payment_id: Uuid,
    amount: rust_decimal::Decimal,
    currency: String,
    customer_id: String,
    merchant_id: String,
}

impl From<&PaymentCreatedEvent> for PaymentFacts {
    fn from(event: &PaymentCreatedEvent) -> Self {
        Self {
            payment_id: event.payment_id,
            amount: event.amount,
            currency: event.currency.clone(),
            customer_id: event.customer_id.clone(),
            merchant_id: event.merchant_id.clone(),
        }
    }
}

impl From<&payment_state::Model> for PaymentFacts {
    fn from(row: &payment_state::Model) -> Self {
        Self {
            payment_id: row.payment_id,
            amount: row.amount,
            currency: row.currency.clone(),
            customer_id: row.customer_id.clone(),
            merchant_id: row.merchant_id.clone(),
        }
    }
}

pub struct OrchestratorService {
    db: Arc<DatabaseConnection>,
    kv: Arc<dyn KvStore>,
    bus: Arc<dyn RequestBus>,
    outbox_notify: Arc<Notify>,
    metrics: Arc<Metrics>,
    fraud_timeout: Duration,
    lock_ttl: Duration,
    sweep_interval: Duration,
    stuck_threshold: Duration,
}

impl OrchestratorService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Arc<DatabaseConnection>,
        kv: Arc<dyn KvStore>,
        bus: Arc<dyn RequestBus>,
        outbox_notify: Arc<Notify>,
        metrics: Arc<Metrics>,
        fraud_timeout: Duration,
        lock_ttl: Duration,
        sweep_interval: Duration,
        stuck_threshold: Duration,
    ) -> Self {
        Self {
            db,
            kv,
            bus,
            outbox_notify,
            metrics,
            fraud_timeout,
            lock_ttl,
            sweep_interval,
            stuck_threshold,
        }
    }

    /// Consumer loop over `payment.created`. At-least-once: retryable
    /// failures nack for redelivery, deterministic ones ack and
    /// dead-letter.
    pub async fn run_consumer(
        self: Arc<Self>,
        log: Arc<dyn EventLog>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("consuming {}", TOPIC_PAYMENT_CREATED);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                polled = log.poll(TOPIC_PAYMENT_CREATED) => match polled {
                    Ok(Some(record)) => self.dispatch(log.as_ref(), record).await,
                    Ok(None) => {}
                    Err(e) => {
                        error!("log poll failed: {e}");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        info!("payment.created consumer stopped");
    }

    async fn dispatch(&self, log: &dyn EventLog, record: LogRecord) {
        let event = match serde_json::from_value::<PaymentCreatedEvent>(record.payload.clone()) {
            Ok(event) => event,
            Err(e) => {
                warn!("undecodable payment.created record, dead-lettering: {e}");
                self.dead_letter(log, &record).await;
                return;
            }
        };

        match self.handle_created(&event).await {
            Ok(()) => {
                if let Err(e) = log.ack(&record).await {
                    error!("ack failed: {e}");
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(payment_id = %event.payment_id, "processing failed, redelivering: {e}");
                self.metrics.consumer_errors.inc();
                if let Err(e) = log.nack(&record).await {
                    error!("nack failed: {e}");
                }
                sleep(Duration::from_millis(200)).await;
            }
            Err(e) => {
                warn!(payment_id = %event.payment_id, "dropping delivery: {e}");
                self.metrics.consumer_errors.inc();
                self.dead_letter(log, &record).await;
            }
        }
    }

    async fn dead_letter(&self, log: &dyn EventLog, record: &LogRecord) {
        if let Err(e) = log
            .publish(
                &dead_letter_topic(&record.topic),
                &record.partition_key,
                record.payload.clone(),
            )
            .await
        {
            error!("dead-letter publish failed: {e}");
        }
        if let Err(e) = log.ack(record).await {
            error!("ack failed: {e}");
        }
    }

    /// Processes one `payment.created` delivery under the per-payment
    /// advisory lock.
    #[instrument(skip(self, event), fields(payment_id = %event.payment_id))]
    pub async fn handle_created(&self, event: &PaymentCreatedEvent) -> Result<(), ServiceError> {
        let lock_key = format!("payment_lock:{}", event.payment_id);
        if !self.kv.set_nx(&lock_key, "1", self.lock_ttl).await? {
            debug!("payment already being processed, skipping duplicate delivery");
            return Ok(());
        }

        let outcome = self.process(event).await;

        if let Err(e) = self.kv.delete(&lock_key).await {
            warn!("failed releasing payment lock (TTL will): {e}");
        }
        outcome
    }

    async fn process(&self, event: &PaymentCreatedEvent) -> Result<(), ServiceError> {
        self.register(event).await?;

        let facts = PaymentFacts::from(event);
        if !self
            .transition(&facts, PaymentState::New, PaymentState::AuthPending)
            .await?
        {
            // Already past NEW: a redelivery of work that completed.
            debug!("payment already advanced, nothing to do");
            return Ok(());
        }

        let verdict = self.consult_fraud(event).await;
        self.record_fraud_verdict(event.payment_id, verdict).await?;

        match verdict {
            FraudVerdict::Approve => {
                for (from, to) in [
                    (PaymentState::AuthPending, PaymentState::Authorized),
                    (PaymentState::Authorized, PaymentState::Captured),
                    (PaymentState::Captured, PaymentState::Succeeded),
                ] {
                    if !self.transition(&facts, from, to).await? {
                        // The sweeper or an operator got here first.
                        break;
                    }
                }
            }
            FraudVerdict::Deny | FraudVerdict::ManualReview | FraudVerdict::Timeout => {
                self.transition(&facts, PaymentState::AuthPending, PaymentState::Failed)
                    .await?;
            }
        }
        Ok(())
    }

    /// Inserts the NEW state row; a duplicate delivery finds it already
    /// there and the insert is a no-op.
    async fn register(&self, event: &PaymentCreatedEvent) -> Result<(), ServiceError> {
        let now = Utc::now();
        let row = payment_state::ActiveModel {
            payment_id: Set(event.payment_id),
            state: Set(PaymentState::New.to_string()),
            previous_state: Set(None),
            fraud_decision: Set(None),
            amount: Set(event.amount),
            currency: Set(event.currency.clone()),
            customer_id: Set(event.customer_id.clone()),
            merchant_id: Set(event.merchant_id.clone()),
            created_at: Set(now),
            updated_at: Set(now),
        };
        payment_state::Entity::insert(row)
            .on_conflict(
                OnConflict::column(payment_state::Column::PaymentId)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    /// Guarded transition: the UPDATE applies only where the current
    /// state equals `from`. The matching state-change event is enqueued
    /// in the same transaction, so "transition committed" and "event will
    /// be emitted" are one fact.
    ///
    /// Returns whether the transition applied; zero rows affected is a
    /// duplicate or stale attempt and is logged, not an error.
    async fn transition(
        &self,
        facts: &PaymentFacts,
        from: PaymentState,
        to: PaymentState,
    ) -> Result<bool, ServiceError> {
        if !from.can_advance_to(to) {
            return Err(ServiceError::Conflict(format!(
                "illegal transition {from} -> {to}"
            )));
        }

        let txn = self.db.begin().await?;
        let applied = payment_state::Entity::update_many()
            .col_expr(payment_state::Column::State, Expr::value(to.as_str()))
            .col_expr(
                payment_state::Column::PreviousState,
                Expr::value(Some(from.as_str().to_string())),
            )
            .col_expr(payment_state::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(payment_state::Column::PaymentId.eq(facts.payment_id))
            .filter(payment_state::Column::State.eq(from.as_str()))
            .exec(&txn)
            .await?
            .rows_affected
            == 1;

        if !applied {
            txn.commit().await?;
            info!(
                payment_id = %facts.payment_id,
                from = %from,
                to = %to,
                "transition skipped: state already moved"
            );
            return Ok(false);
        }

        let event = PaymentStateChangedEvent {
            payment_id: facts.payment_id,
            state: to,
            previous_state: from,
            amount: facts.amount,
            currency: facts.currency.clone(),
            customer_id: facts.customer_id.clone(),
            merchant_id: facts.merchant_id.clone(),
            timestamp: Utc::now(),
        };
        events::outbox::enqueue(
            &txn,
            TOPIC_PAYMENT_STATE_CHANGED,
            &facts.payment_id.to_string(),
            serde_json::to_value(&event)?,
        )
        .await?;
        txn.commit().await?;

        self.outbox_notify.notify_one();
        self.metrics.state_transitions.inc();
        info!(
            payment_id = %facts.payment_id,
            from = %from,
            to = %to,
            "payment state transition"
        );
        Ok(true)
    }

    /// Blocking fraud consultation. Any failure to obtain a usable reply
    /// inside the deadline collapses to `Timeout`, which deterministically
    /// fails the payment.
    async fn consult_fraud(&self, event: &PaymentCreatedEvent) -> FraudVerdict {
        let request = FraudCheckRequest {
            payment_id: event.payment_id,
            amount: event.amount,
            customer_id: event.customer_id.clone(),
        };
        let payload = match serde_json::to_value(&request) {
            Ok(payload) => payload,
            Err(e) => {
                error!("unencodable fraud request: {e}");
                return FraudVerdict::Timeout;
            }
        };

        match self
            .bus
            .request(SUBJECT_FRAUD_CHECK, payload, self.fraud_timeout)
            .await
        {
            Ok(reply) => match serde_json::from_value::<FraudCheckReply>(reply) {
                Ok(reply) => {
                    info!(
                        payment_id = %event.payment_id,
                        decision = %reply.decision,
                        reason = %reply.reason,
                        "fraud check completed"
                    );
                    reply.decision
                }
                Err(e) => {
                    warn!(payment_id = %event.payment_id, "malformed fraud reply: {e}");
                    FraudVerdict::Timeout
                }
            },
            Err(e) => {
                warn!(payment_id = %event.payment_id, "fraud check failed: {e}");
                FraudVerdict::Timeout
            }
        }
    }

    /// Records the verdict only where none is set: the first decision is
    /// the one acted upon.
    async fn record_fraud_verdict(
        &self,
        payment_id: Uuid,
        verdict: FraudVerdict,
    ) -> Result<(), ServiceError> {
        payment_state::Entity::update_many()
            .col_expr(
                payment_state::Column::FraudDecision,
                Expr::value(Some(verdict.as_str().to_string())),
            )
            .filter(payment_state::Column::PaymentId.eq(payment_id))
            .filter(payment_state::Column::FraudDecision.is_null())
            .exec(&*self.db)
            .await?;

        match verdict {
            FraudVerdict::Approve => self.metrics.fraud_approvals.inc(),
            FraudVerdict::Deny => self.metrics.fraud_denials.inc(),
            FraudVerdict::ManualReview => self.metrics.fraud_manual_reviews.inc(),
            FraudVerdict::Timeout => self.metrics.fraud_timeouts.inc(),
        }
        Ok(())
    }

    /// Background sweep demoting authorizations that outlived the fraud
    /// deadline; the only state mutation that happens off the consumer
    /// path.
    pub async fn run_sweeper(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            threshold_secs = self.stuck_threshold.as_secs(),
            "stall sweeper started"
        );
        let mut ticker = tokio::time::interval(self.sweep_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_stalled().await {
                        error!("stall sweep failed: {e}");
                    }
                }
            }
        }
        info!("stall sweeper stopped");
    }

    async fn sweep_stalled(&self) -> Result<(), ServiceError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.stuck_threshold.as_secs() as i64);
        let stalled = payment_state::Entity::find()
            .filter(payment_state::Column::State.eq(PaymentState::AuthPending.as_str()))
            .filter(payment_state::Column::UpdatedAt.lt(cutoff))
            .all(&*self.db)
            .await?;

        for row in stalled {
            self.record_fraud_verdict(row.payment_id, FraudVerdict::Timeout)
                .await?;
            let facts = PaymentFacts::from(&row);
            if self
                .transition(&facts, PaymentState::AuthPending, PaymentState::Failed)
                .await?
            {
                warn!(payment_id = %row.payment_id, "demoted stalled authorization");
            }
        }
        Ok(())
    }

    pub async fn get_state(&self, payment_id: Uuid) -> Result<payment_state::Model, ServiceError> {
        payment_state::Entity::find_by_id(payment_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("payment state {payment_id} not found")))
    }
}
