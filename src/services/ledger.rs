//! Double-entry ledger.
//!
//! Consumes `payment.state.changed` and posts a balanced entry group per
//! settled payment: debit the customer source account, credit the
//! merchant net of the platform fee, credit the platform the fee. Entry
//! idempotency keys make redeliveries no-ops; any failure aborts the
//! whole group and the delivery is redelivered.

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DatabaseTransaction, DbBackend, EntityTrait,
    NotSet, QueryFilter, QueryOrder, QuerySelect, Set, TransactionTrait,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::domain::{AccountType, EntryType, PaymentState};
use crate::entities::{account, ledger_entry};
use crate::errors::ServiceError;
use crate::events::{dead_letter_topic, PaymentStateChangedEvent, TOPIC_PAYMENT_STATE_CHANGED};
use crate::message_log::{EventLog, LogRecord};
use crate::metrics::Metrics;

/// Pre-seeded fee collection account.
pub const PLATFORM_ACCOUNT: &str = "platform-001";

const ACCOUNT_STATUS_ACTIVE: &str = "active";

pub struct LedgerService {
    db: Arc<DatabaseConnection>,
    platform_fee: Decimal,
    metrics: Arc<Metrics>,
}

impl LedgerService {
    pub fn new(db: Arc<DatabaseConnection>, platform_fee: Decimal, metrics: Arc<Metrics>) -> Self {
        Self {
            db,
            platform_fee,
            metrics,
        }
    }

    /// Seeds the platform account.
    pub async fn bootstrap(&self) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;
        ensure_account(&txn, PLATFORM_ACCOUNT, AccountType::Platform, "USD").await?;
        txn.commit().await?;
        Ok(())
    }

    /// Consumer loop over `payment.state.changed`.
    pub async fn run_consumer(
        self: Arc<Self>,
        log: Arc<dyn EventLog>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("consuming {}", TOPIC_PAYMENT_STATE_CHANGED);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                polled = log.poll(TOPIC_PAYMENT_STATE_CHANGED) => match polled {
                    Ok(Some(record)) => self.dispatch(log.as_ref(), record).await,
                    Ok(None) => {}
                    Err(e) => {
                        error!("log poll failed: {e}");
                        sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        info!("payment.state.changed consumer stopped");
    }

    async fn dispatch(&self, log: &dyn EventLog, record: LogRecord) {
        let event = match serde_json::from_value::<PaymentStateChangedEvent>(record.payload.clone())
        {
            Ok(event) => event,
            Err(e) => {
                warn!("undecodable state-change record, dead-lettering: {e}");
                self.dead_letter(log, &record).await;
                return;
            }
        };

        match self.handle_state_changed(&event).await {
            Ok(()) => {
                if let Err(e) = log.ack(&record).await {
                    error!("ack failed: {e}");
                }
            }
            Err(e) if e.is_retryable() => {
                warn!(payment_id = %event.payment_id, "posting failed, redelivering: {e}");
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

    /// Only settled payments move money; every other transition is
    /// observability traffic.
    pub async fn handle_state_changed(
        &self,
        event: &PaymentStateChangedEvent,
    ) -> Result<(), ServiceError> {
        if event.state != PaymentState::Succeeded {
            return Ok(());
        }
        self.post_payment(event).await
    }

    /// Posts the balanced group for one settled payment inside a single
    /// transaction: all entries land or none do.
    #[instrument(skip(self, event), fields(payment_id = %event.payment_id))]
    pub async fn post_payment(
        &self,
        event: &PaymentStateChangedEvent,
    ) -> Result<(), ServiceError> {
        let merchant_account = format!("merchant-{}", event.merchant_id);
        let customer_account = format!("customer-{}", event.customer_id);
        let split = fee_split(event.amount, self.platform_fee);
        let key_base = format!("{}-{}", event.payment_id, event.state);

        let txn = self.db.begin().await?;
        ensure_account(
            &txn,
            &customer_account,
            AccountType::Customer,
            &event.currency,
        )
        .await?;
        ensure_account(
            &txn,
            &merchant_account,
            AccountType::Merchant,
            &event.currency,
        )
        .await?;

        let mut posted: u64 = 0;
        for (account_id, entry_type, amount, role) in [
            (
                customer_account.as_str(),
                EntryType::Debit,
                split.customer_debit,
                "customer",
            ),
            (
                merchant_account.as_str(),
                EntryType::Credit,
                split.merchant_credit,
                "merchant",
            ),
            (
                PLATFORM_ACCOUNT,
                EntryType::Credit,
                split.platform_credit,
                "platform",
            ),
        ] {
            if self
                .post_entry(
                    &txn,
                    account_id,
                    event.payment_id,
                    entry_type,
                    amount,
                    &format!("{key_base}-{role}"),
                )
                .await?
            {
                posted += 1;
            }
        }
        txn.commit().await?;

        if posted > 0 {
            self.metrics.ledger_entries_posted.add(posted);
            info!(
                merchant = %merchant_account,
                amount = %event.amount,
                fee = %split.platform_credit,
                "recorded ledger entries"
            );
        } else {
            self.metrics.ledger_duplicates.inc();
            debug!("entry group already posted, duplicate delivery absorbed");
        }
        Ok(())
    }

    /// Posts a single entry under the account row lock.
    ///
    /// Returns whether an entry was written; `false` means the
    /// idempotency key already existed and the account was untouched.
    async fn post_entry(
        &self,
        txn: &DatabaseTransaction,
        account_id: &str,
        payment_id: Uuid,
        entry_type: EntryType,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<bool, ServiceError> {
        if amount < Decimal::ZERO {
            return Err(ServiceError::Internal(format!(
                "entry amount must not be negative: {amount}"
            )));
        }
        // Entries are strictly positive; a zero leg (fee-only payment)
        // is simply omitted from the group.
        if amount.is_zero() {
            return Ok(false);
        }

        let already_posted = ledger_entry::Entity::find()
            .filter(ledger_entry::Column::IdempotencyKey.eq(idempotency_key))
            .one(txn)
            .await?
            .is_some();
        if already_posted {
            return Ok(false);
        }

        // Serialize balance updates per account. SQLite has no FOR
        // UPDATE; its single-writer transactions give the same effect.
        let mut query = account::Entity::find_by_id(account_id);
        if txn.get_database_backend() == DbBackend::Postgres {
            query = query.lock_exclusive();
        }
        let account = query.one(txn).await?.ok_or_else(|| {
            ServiceError::Internal(format!("account {account_id} missing during posting"))
        })?;

        let new_balance = match entry_type {
            EntryType::Credit => account.balance + amount,
            EntryType::Debit => account.balance - amount,
        };
        let account_type: AccountType = account
            .account_type
            .parse()
            .map_err(ServiceError::Internal)?;
        if new_balance < Decimal::ZERO && !account_type.allows_negative_balance() {
            return Err(ServiceError::NegativeBalance(format!(
                "{entry_type} of {amount} would take account {account_id} to {new_balance}"
            )));
        }

        let entry = ledger_entry::ActiveModel {
            id: NotSet,
            account_id: Set(account_id.to_string()),
            payment_id: Set(payment_id),
            entry_type: Set(entry_type.to_string()),
            amount: Set(amount),
            balance: Set(new_balance),
            idempotency_key: Set(idempotency_key.to_string()),
            created_at: Set(Utc::now()),
        };
        let inserted = ledger_entry::Entity::insert(entry)
            .on_conflict(
                OnConflict::column(ledger_entry::Column::IdempotencyKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(txn)
            .await?;
        if inserted == 0 {
            // Raced with another posting of the same group.
            return Ok(false);
        }

        account::Entity::update_many()
            .col_expr(
                account::Column::Balance,
                sea_orm::sea_query::Expr::value(new_balance),
            )
            .col_expr(
                account::Column::AvailableBalance,
                sea_orm::sea_query::Expr::value(new_balance),
            )
            .col_expr(
                account::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(Utc::now()),
            )
            .filter(account::Column::Id.eq(account_id))
            .exec(txn)
            .await?;
        Ok(true)
    }

    pub async fn account_balance(&self, account_id: &str) -> Result<account::Model, ServiceError> {
        account::Entity::find_by_id(account_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("account {account_id} not found")))
    }

    /// Latest 100 entries for an account, newest first.
    pub async fn account_entries(
        &self,
        account_id: &str,
    ) -> Result<Vec<ledger_entry::Model>, ServiceError> {
        ledger_entry::Entity::find()
            .filter(ledger_entry::Column::AccountId.eq(account_id))
            .order_by_desc(ledger_entry::Column::Id)
            .limit(100)
            .all(&*self.db)
            .await
            .map_err(Into::into)
    }

    /// All entries for a payment, oldest first.
    pub async fn payment_entries(
        &self,
        payment_id: Uuid,
    ) -> Result<Vec<ledger_entry::Model>, ServiceError> {
        ledger_entry::Entity::find()
            .filter(ledger_entry::Column::PaymentId.eq(payment_id))
            .order_by_asc(ledger_entry::Column::Id)
            .all(&*self.db)
            .await
            .map_err(Into::into)
    }
}

/// How a settled amount divides across the posting group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSplit {
    pub customer_debit: Decimal,
    pub merchant_credit: Decimal,
    pub platform_credit: Decimal,
}

/// Splits a settled amount into the balanced posting group. The fee is
/// capped at the amount, so a payment smaller than the flat fee yields
/// no merchant share rather than a negative one.
pub fn fee_split(amount: Decimal, platform_fee: Decimal) -> FeeSplit {
    let fee = platform_fee.min(amount);
    FeeSplit {
        customer_debit: amount,
        merchant_credit: amount - fee,
        platform_credit: fee,
    }
}

/// Auto-provisions an absent account with a zero balance.
async fn ensure_account<C: ConnectionTrait>(
    conn: &C,
    account_id: &str,
    account_type: AccountType,
    currency: &str,
) -> Result<(), ServiceError> {
    let now = Utc::now();
    let row = account::ActiveModel {
        id: Set(account_id.to_string()),
        account_type: Set(account_type.to_string()),
        balance: Set(Decimal::ZERO),
        available_balance: Set(Decimal::ZERO),
        hold_balance: Set(Decimal::ZERO),
        currency: Set(currency.to_string()),
        status: Set(ACCOUNT_STATUS_ACTIVE.to_string()),
        created_at: Set(now),
        updated_at: Set(now),
    };
    account::Entity::insert(row)
        .on_conflict(
            OnConflict::column(account::Column::Id)
                .do_nothing()
                .to_owned(),
        )
        .exec_without_returning(conn)
        .await?;
    Ok(())
}
