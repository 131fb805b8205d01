use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One side of a double-entry posting. `balance` is the account balance
/// immediately after this entry; the unique idempotency key absorbs
/// duplicate deliveries of the same state-change event.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "ledger_entries")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub account_id: String,

    pub payment_id: Uuid,

    pub entry_type: String,

    #[sea_orm(column_type = "Decimal(Some((20, 2)))")]
    pub amount: Decimal,

    #[sea_orm(column_type = "Decimal(Some((20, 2)))")]
    pub balance: Decimal,

    #[sea_orm(unique)]
    pub idempotency_key: String,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
