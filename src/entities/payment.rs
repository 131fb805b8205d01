use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A payment intent as accepted at the ingress gateway.
///
/// The idempotency key makes client retries collapse onto one row; the
/// status only ever changes through the administrative confirm path.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "payments")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Uuid")]
    pub id: Uuid,

    #[sea_orm(column_type = "Decimal(Some((15, 2)))")]
    pub amount: Decimal,

    pub currency: String,

    pub customer_id: String,

    pub merchant_id: String,

    pub status: String,

    #[sea_orm(unique)]
    pub idempotency_key: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
