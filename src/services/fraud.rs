//! Rules-based fraud evaluator.
//!
//! Deterministic, short-circuit rule chain with a sliding velocity
//! window in the shared KV store. Replies are sent before the audit row
//! is persisted: a slow or failing database must never stall a payment
//! decision.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    NotSet, PaginatorTrait, QueryFilter, Set, Statement,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, instrument, warn};

use crate::cache::KvStore;
use crate::domain::FraudVerdict;
use crate::entities::{fraud_decision, fraud_rule};
use crate::errors::ServiceError;
use crate::events::{FraudCheckReply, FraudCheckRequest, SUBJECT_FRAUD_CHECK};
use crate::message_bus::RequestBus;
use crate::metrics::Metrics;

const VELOCITY_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Evaluation thresholds; defaults mirror the seeded rule catalog.
#[derive(Debug, Clone)]
pub struct FraudRuleSet {
    /// Rule 1: amounts above this are denied outright.
    pub amount_ceiling: Decimal,
    /// Rule 2: payments per customer per hour before denial.
    pub velocity_limit: i64,
    /// Rule 3: amounts above this go to manual review.
    pub review_threshold: Decimal,
}

impl Default for FraudRuleSet {
    fn default() -> Self {
        Self {
            amount_ceiling: Decimal::new(10_000, 0),
            velocity_limit: 5,
            review_threshold: Decimal::new(5_000, 0),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FraudStats {
    pub total_checks: u64,
    pub approved_count: u64,
    pub denied_count: u64,
    pub manual_review_count: u64,
    pub avg_risk_score: f64,
}

pub struct FraudService {
    db: Arc<DatabaseConnection>,
    kv: Arc<dyn KvStore>,
    rules: FraudRuleSet,
    metrics: Arc<Metrics>,
}

impl FraudService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        kv: Arc<dyn KvStore>,
        rules: FraudRuleSet,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            db,
            kv,
            rules,
            metrics,
        }
    }

    /// Seeds the rule catalog rows describing the active thresholds.
    pub async fn bootstrap(&self) -> Result<(), ServiceError> {
        let now = Utc::now();
        let rules = [
            fraud_rule::ActiveModel {
                id: NotSet,
                name: Set("High Amount Check".to_string()),
                max_amount: Set(Some(self.rules.amount_ceiling)),
                max_per_hour: Set(None),
                description: Set(format!(
                    "Deny payments over {}",
                    self.rules.amount_ceiling
                )),
                active: Set(true),
                created_at: Set(now),
            },
            fraud_rule::ActiveModel {
                id: NotSet,
                name: Set("Velocity Check".to_string()),
                max_amount: Set(None),
                max_per_hour: Set(Some(self.rules.velocity_limit as i32)),
                description: Set(format!(
                    "Max {} payments per hour per customer",
                    self.rules.velocity_limit
                )),
                active: Set(true),
                created_at: Set(now),
            },
        ];
        for rule in rules {
            fraud_rule::Entity::insert(rule)
                .on_conflict(
                    OnConflict::column(fraud_rule::Column::Name)
                        .do_nothing()
                        .to_owned(),
                )
                .exec_without_returning(&*self.db)
                .await?;
        }
        Ok(())
    }

    /// Runs the rule chain. First triggering rule wins.
    ///
    /// A KV outage degrades gracefully: the velocity rule is skipped and
    /// the amount rules still apply, trading burst detection for
    /// availability.
    #[instrument(skip(self, request), fields(payment_id = %request.payment_id))]
    pub async fn evaluate(&self, request: &FraudCheckRequest) -> FraudCheckReply {
        if request.amount > self.rules.amount_ceiling {
            return FraudCheckReply {
                decision: FraudVerdict::Deny,
                reason: format!("Amount exceeds {} limit", self.rules.amount_ceiling),
            };
        }

        let velocity_key = format!("fraud:velocity:{}", request.customer_id);
        match self.kv.incr(&velocity_key).await {
            Ok(count) => {
                if count == 1 {
                    if let Err(e) = self.kv.expire(&velocity_key, VELOCITY_WINDOW).await {
                        warn!("failed arming velocity window: {e}");
                    }
                }
                if count > self.rules.velocity_limit {
                    return FraudCheckReply {
                        decision: FraudVerdict::Deny,
                        reason: "Too many payments in the last hour (velocity check failed)"
                            .to_string(),
                    };
                }
            }
            Err(e) => warn!("velocity counter unavailable, skipping rule: {e}"),
        }

        if request.amount > self.rules.review_threshold {
            return FraudCheckReply {
                decision: FraudVerdict::ManualReview,
                reason: "High-value transaction requires manual review".to_string(),
            };
        }

        FraudCheckReply {
            decision: FraudVerdict::Approve,
            reason: "All fraud checks passed".to_string(),
        }
    }

    /// Appends the audit row for a decision.
    pub async fn record_decision(
        &self,
        request: &FraudCheckRequest,
        reply: &FraudCheckReply,
    ) -> Result<(), ServiceError> {
        let row = fraud_decision::ActiveModel {
            id: NotSet,
            payment_id: Set(request.payment_id),
            customer_id: Set(request.customer_id.clone()),
            amount: Set(request.amount),
            decision: Set(reply.decision.to_string()),
            reason: Set(reply.reason.clone()),
            risk_score: Set(risk_score(request.amount)),
            created_at: Set(Utc::now()),
        };
        row.insert(&*self.db).await.map(|_| ()).map_err(Into::into)
    }

    /// Responder loop on `fraud.check`. The reply goes out first; the
    /// audit write is best-effort afterwards.
    pub async fn run_responder(
        self: Arc<Self>,
        bus: Arc<dyn RequestBus>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("responding on {}", SUBJECT_FRAUD_CHECK);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                next = bus.next_request(SUBJECT_FRAUD_CHECK) => match next {
                    Ok(Some(bus_request)) => {
                        let request = match serde_json::from_value::<FraudCheckRequest>(
                            bus_request.payload.clone(),
                        ) {
                            Ok(request) => request,
                            Err(e) => {
                                // No usable correlation data; let the
                                // requester time out.
                                error!("undecodable fraud.check request: {e}");
                                continue;
                            }
                        };

                        let reply = self.evaluate(&request).await;
                        match serde_json::to_value(&reply) {
                            Ok(payload) => {
                                if let Err(e) = bus.reply(&bus_request, payload).await {
                                    error!(
                                        payment_id = %request.payment_id,
                                        "failed sending fraud reply: {e}"
                                    );
                                }
                            }
                            Err(e) => error!("unencodable fraud reply: {e}"),
                        }

                        match reply.decision {
                            FraudVerdict::Approve => self.metrics.fraud_approvals.inc(),
                            FraudVerdict::Deny => self.metrics.fraud_denials.inc(),
                            FraudVerdict::ManualReview => self.metrics.fraud_manual_reviews.inc(),
                            FraudVerdict::Timeout => {}
                        }

                        if let Err(e) = self.record_decision(&request, &reply).await {
                            error!(
                                payment_id = %request.payment_id,
                                "failed persisting fraud decision: {e}"
                            );
                        } else {
                            info!(
                                payment_id = %request.payment_id,
                                decision = %reply.decision,
                                "fraud check recorded"
                            );
                        }
                    }
                    Ok(None) => {}
                    Err(e) => {
                        error!("bus poll failed: {e}");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        info!("fraud responder stopped");
    }

    pub async fn stats(&self) -> Result<FraudStats, ServiceError> {
        let total_checks = fraud_decision::Entity::find().count(&*self.db).await?;
        let approved_count = self.count_decision(FraudVerdict::Approve).await?;
        let denied_count = self.count_decision(FraudVerdict::Deny).await?;
        let manual_review_count = self.count_decision(FraudVerdict::ManualReview).await?;

        let backend = self.db.get_database_backend();
        let avg_sql = match backend {
            DbBackend::Postgres => {
                "SELECT COALESCE(AVG(risk_score)::float8, 0) AS avg_risk FROM fraud_decisions"
            }
            _ => "SELECT COALESCE(AVG(CAST(risk_score AS REAL)), 0) AS avg_risk FROM fraud_decisions",
        };
        let avg_risk_score = self
            .db
            .query_one(Statement::from_string(backend, avg_sql))
            .await?
            .and_then(|row| row.try_get::<f64>("", "avg_risk").ok())
            .unwrap_or(0.0);

        Ok(FraudStats {
            total_checks,
            approved_count,
            denied_count,
            manual_review_count,
            avg_risk_score,
        })
    }

    async fn count_decision(&self, verdict: FraudVerdict) -> Result<u64, ServiceError> {
        fraud_decision::Entity::find()
            .filter(fraud_decision::Column::Decision.eq(verdict.as_str()))
            .count(&*self.db)
            .await
            .map_err(Into::into)
    }
}

/// Piecewise risk score: +30 above 1000, +50 more above 5000, clamped to
/// [0, 100]. The breakpoints are part of the scoring contract and are
/// deliberately not configurable.
pub fn risk_score(amount: Decimal) -> i32 {
    let mut score = 0;
    if amount > Decimal::new(1_000, 0) {
        score += 30;
    }
    if amount > Decimal::new(5_000, 0) {
        score += 50;
    }
    score.clamp(0, 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryKv;
    use crate::db;
    use rust_decimal_macros::dec;
    use sea_orm::Database;
    use uuid::Uuid;

    async fn service() -> FraudService {
        let url = format!(
            "sqlite:file:fraud-{}?mode=memory&cache=shared",
            Uuid::new_v4().simple()
        );
        let conn = Database::connect(&url).await.unwrap();
        db::ensure_fraud_schema(&conn).await.unwrap();
        FraudService::new(
            Arc::new(conn),
            Arc::new(InMemoryKv::new()),
            FraudRuleSet::default(),
            Arc::new(Metrics::new("fraud-service")),
        )
    }

    fn request(amount: Decimal, customer: &str) -> FraudCheckRequest {
        FraudCheckRequest {
            payment_id: Uuid::new_v4(),
            amount,
            customer_id: customer.to_string(),
        }
    }

    #[tokio::test]
    async fn amount_ceiling_denies_before_anything_else() {
        let svc = service().await;
        let reply = svc.evaluate(&request(dec!(15000.00), "c-ceiling")).await;
        assert_eq!(reply.decision, FraudVerdict::Deny);

        // The short-circuit left the velocity counter untouched: five
        // small payments still fit in the window, the sixth does not.
        for _ in 0..5 {
            let reply = svc.evaluate(&request(dec!(100.00), "c-ceiling")).await;
            assert_eq!(reply.decision, FraudVerdict::Approve);
        }
        let reply = svc.evaluate(&request(dec!(100.00), "c-ceiling")).await;
        assert_eq!(reply.decision, FraudVerdict::Deny);
    }

    #[tokio::test]
    async fn sixth_payment_in_window_is_denied() {
        let svc = service().await;
        for _ in 0..5 {
            let reply = svc.evaluate(&request(dec!(100.00), "c-velocity")).await;
            assert_eq!(reply.decision, FraudVerdict::Approve);
        }
        let reply = svc.evaluate(&request(dec!(100.00), "c-velocity")).await;
        assert_eq!(reply.decision, FraudVerdict::Deny);
        assert!(reply.reason.contains("velocity"));
    }

    #[tokio::test]
    async fn high_value_goes_to_manual_review() {
        let svc = service().await;
        let reply = svc.evaluate(&request(dec!(7500.00), "c-review")).await;
        assert_eq!(reply.decision, FraudVerdict::ManualReview);
    }

    #[tokio::test]
    async fn boundary_amounts_are_inclusive() {
        let svc = service().await;
        // Exactly at the thresholds: neither rule fires.
        let reply = svc.evaluate(&request(dec!(5000.00), "c-edge")).await;
        assert_eq!(reply.decision, FraudVerdict::Approve);
        let reply = svc.evaluate(&request(dec!(10000.00), "c-edge2")).await;
        assert_eq!(reply.decision, FraudVerdict::ManualReview);
    }

    #[tokio::test]
    async fn decisions_are_audited() {
        let svc = service().await;
        let req = request(dec!(42.00), "c-audit");
        let reply = svc.evaluate(&req).await;
        svc.record_decision(&req, &reply).await.unwrap();

        let stats = svc.stats().await.unwrap();
        assert_eq!(stats.total_checks, 1);
        assert_eq!(stats.approved_count, 1);
        assert_eq!(stats.avg_risk_score, 0.0);
    }

    #[tokio::test]
    async fn bootstrap_seeding_is_idempotent() {
        let svc = service().await;
        svc.bootstrap().await.unwrap();
        svc.bootstrap().await.unwrap();
        let rules = fraud_rule::Entity::find().all(&*svc.db).await.unwrap();
        assert_eq!(rules.len(), 2);
    }

    #[test]
    fn risk_score_is_piecewise_and_clamped() {
        assert_eq!(risk_score(dec!(500.00)), 0);
        assert_eq!(risk_score(dec!(1000.00)), 0);
        assert_eq!(risk_score(dec!(1000.01)), 30);
        assert_eq!(risk_score(dec!(5000.00)), 30);
        assert_eq!(risk_score(dec!(5000.01)), 80);
        assert_eq!(risk_score(dec!(9999.99)), 80);
    }
}
