use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-payment state machine row owned by the orchestrator.
///
/// Carries a snapshot of the intent (amount, currency, parties) so every
/// emitted state-change event can report the payment's real figures,
/// including events produced by the stall sweeper long after the
/// originating message is gone.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payment_states")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Uuid")]
    pub payment_id: Uuid,

    pub state: String,

    pub previous_state: Option<String>,

    pub fraud_decision: Option<String>,

    #[sea_orm(column_type = "Decimal(Some((15, 2)))")]
    pub amount: Decimal,

    pub currency: String,

    pub customer_id: String,

    pub merchant_id: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
