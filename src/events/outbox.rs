//! Transactional outbox.
//!
//! Business writes enqueue their events in the same store transaction;
//! a single background publisher per service drains pending rows to the
//! event log in insertion order. A crash after commit but before publish
//! is repaired on the next drain, closing the gap between "row stored"
//! and "event emitted".

use chrono::{Duration as ChronoDuration, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, NotSet,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::entities::outbox_event;
use crate::errors::ServiceError;
use crate::message_log::EventLog;

const MAX_ATTEMPTS: i32 = 8;
const BASE_BACKOFF_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Delivered,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Delivered => "delivered",
            OutboxStatus::Failed => "failed",
        }
    }
}

/// Enqueues an event inside the caller's transaction.
pub async fn enqueue<C: ConnectionTrait>(
    conn: &C,
    topic: &str,
    partition_key: &str,
    payload: Value,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let row = outbox_event::ActiveModel {
        id: NotSet,
        topic: Set(topic.to_string()),
        partition_key: Set(partition_key.to_string()),
        payload: Set(payload),
        status: Set(OutboxStatus::Pending.as_str().to_string()),
        attempts: Set(0),
        available_at: Set(now),
        created_at: Set(now),
        processed_at: Set(None),
    };
    row.insert(conn).await?;
    Ok(())
}

/// Background publisher draining the outbox table to the event log.
pub struct OutboxPublisher {
    db: Arc<DatabaseConnection>,
    log: Arc<dyn EventLog>,
    notify: Arc<Notify>,
    poll_interval: Duration,
    batch_size: u64,
}

impl OutboxPublisher {
    pub fn new(db: Arc<DatabaseConnection>, log: Arc<dyn EventLog>, notify: Arc<Notify>) -> Self {
        Self {
            db,
            log,
            notify,
            poll_interval: Duration::from_millis(500),
            batch_size: 50,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Runs until the shutdown channel flips, then drains one final time.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("outbox publisher started");
        // Reclaim rows a previous incarnation left mid-claim; there is
        // exactly one publisher per service, so they are ours.
        if let Err(e) = self.reset_processing().await {
            error!("failed reclaiming in-flight outbox rows: {e}");
        }
        loop {
            if let Err(e) = self.drain_once().await {
                error!("outbox drain failed: {e}");
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = self.notify.notified() => {}
                _ = sleep(self.poll_interval) => {}
            }
        }
        if let Err(e) = self.drain_once().await {
            warn!("final outbox drain failed: {e}");
        }
        info!("outbox publisher stopped");
    }

    async fn reset_processing(&self) -> Result<(), ServiceError> {
        let reclaimed = outbox_event::Entity::update_many()
            .col_expr(
                outbox_event::Column::Status,
                Expr::value(OutboxStatus::Pending.as_str()),
            )
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Processing.as_str()))
            .exec(&*self.db)
            .await?
            .rows_affected;
        if reclaimed > 0 {
            warn!("reclaimed {reclaimed} outbox rows left in flight");
        }
        Ok(())
    }

    /// Publishes one batch of pending rows, oldest first. Returns how
    /// many were handed to the log.
    ///
    /// The drain never publishes around an unpublished older row: on a
    /// failure it stops, and while the head row is backing off nothing
    /// younger goes out. Log consumers rely on per-key order.
    pub async fn drain_once(&self) -> Result<usize, ServiceError> {
        let pending = outbox_event::Entity::find()
            .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
            .order_by_asc(outbox_event::Column::Id)
            .limit(self.batch_size)
            .all(&*self.db)
            .await?;

        let mut published = 0;
        for row in pending {
            if row.available_at > Utc::now() {
                break;
            }
            // Claim the row; losing the race means another publisher of
            // this service already owns it.
            let claimed = outbox_event::Entity::update_many()
                .col_expr(
                    outbox_event::Column::Status,
                    Expr::value(OutboxStatus::Processing.as_str()),
                )
                .col_expr(
                    outbox_event::Column::Attempts,
                    Expr::col(outbox_event::Column::Attempts).add(1),
                )
                .filter(outbox_event::Column::Id.eq(row.id))
                .filter(outbox_event::Column::Status.eq(OutboxStatus::Pending.as_str()))
                .exec(&*self.db)
                .await?
                .rows_affected
                == 1;
            if !claimed {
                continue;
            }

            match self
                .log
                .publish(&row.topic, &row.partition_key, row.payload.clone())
                .await
            {
                Ok(()) => {
                    outbox_event::Entity::update_many()
                        .col_expr(
                            outbox_event::Column::Status,
                            Expr::value(OutboxStatus::Delivered.as_str()),
                        )
                        .col_expr(
                            outbox_event::Column::ProcessedAt,
                            Expr::value(Some(Utc::now())),
                        )
                        .filter(outbox_event::Column::Id.eq(row.id))
                        .exec(&*self.db)
                        .await?;
                    debug!(topic = %row.topic, key = %row.partition_key, "outbox event published");
                    published += 1;
                }
                Err(e) => {
                    let attempts = row.attempts + 1;
                    if attempts >= MAX_ATTEMPTS {
                        warn!(id = row.id, "outbox event exhausted retries: {e}");
                        outbox_event::Entity::update_many()
                            .col_expr(
                                outbox_event::Column::Status,
                                Expr::value(OutboxStatus::Failed.as_str()),
                            )
                            .filter(outbox_event::Column::Id.eq(row.id))
                            .exec(&*self.db)
                            .await?;
                    } else {
                        let backoff = BASE_BACKOFF_SECS.saturating_pow(attempts as u32);
                        warn!(
                            id = row.id,
                            attempts, "outbox publish failed, retrying in {backoff}s: {e}"
                        );
                        outbox_event::Entity::update_many()
                            .col_expr(
                                outbox_event::Column::Status,
                                Expr::value(OutboxStatus::Pending.as_str()),
                            )
                            .col_expr(
                                outbox_event::Column::AvailableAt,
                                Expr::value(Utc::now() + ChronoDuration::seconds(backoff as i64)),
                            )
                            .filter(outbox_event::Column::Id.eq(row.id))
                            .exec(&*self.db)
                            .await?;
                    }
                    break;
                }
            }
        }
        Ok(published)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::message_log::InMemoryEventLog;
    use sea_orm::{Database, TransactionTrait};
    use serde_json::json;

    async fn test_db() -> Arc<DatabaseConnection> {
        // Named shared-cache memory db: one database across the pool.
        let url = format!(
            "sqlite:file:outbox-{}?mode=memory&cache=shared",
            uuid::Uuid::new_v4().simple()
        );
        let db = Database::connect(&url).await.unwrap();
        db::ensure_gateway_schema(&db).await.unwrap();
        Arc::new(db)
    }

    #[tokio::test]
    async fn drains_committed_rows_in_order() {
        let db = test_db().await;
        let log = Arc::new(InMemoryEventLog::new());

        let txn = db.begin().await.unwrap();
        enqueue(&txn, "payment.created", "p-1", json!({ "seq": 0 }))
            .await
            .unwrap();
        enqueue(&txn, "payment.created", "p-1", json!({ "seq": 1 }))
            .await
            .unwrap();
        txn.commit().await.unwrap();

        let publisher = OutboxPublisher::new(db.clone(), log.clone(), Arc::new(Notify::new()));
        let published = publisher.drain_once().await.unwrap();
        assert_eq!(published, 2);

        let history = log.history("payment.created");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].payload["seq"], 0);
        assert_eq!(history[1].payload["seq"], 1);

        // Nothing left pending.
        assert_eq!(publisher.drain_once().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn rolled_back_rows_never_publish() {
        let db = test_db().await;
        let log = Arc::new(InMemoryEventLog::new());

        let txn = db.begin().await.unwrap();
        enqueue(&txn, "payment.created", "p-1", json!({}))
            .await
            .unwrap();
        txn.rollback().await.unwrap();

        let publisher = OutboxPublisher::new(db.clone(), log.clone(), Arc::new(Notify::new()));
        assert_eq!(publisher.drain_once().await.unwrap(), 0);
        assert!(log.history("payment.created").is_empty());
    }
}
