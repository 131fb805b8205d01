use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit row for every fraud evaluation. A payment may
/// accumulate several rows across re-evaluations; only the first is acted
/// on by the orchestrator.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "fraud_decisions")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub payment_id: Uuid,

    pub customer_id: String,

    #[sea_orm(column_type = "Decimal(Some((15, 2)))")]
    pub amount: Decimal,

    pub decision: String,

    pub reason: String,

    pub risk_score: i32,

    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
