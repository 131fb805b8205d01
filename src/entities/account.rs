use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Ledger account. The balance is derivable from the account's entries
/// (credits minus debits); it is stored denormalized and updated under a
/// row lock inside each posting transaction.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub account_type: String,

    #[sea_orm(column_type = "Decimal(Some((20, 2)))")]
    pub balance: Decimal,

    #[sea_orm(column_type = "Decimal(Some((20, 2)))")]
    pub available_balance: Decimal,

    #[sea_orm(column_type = "Decimal(Some((20, 2)))")]
    pub hold_balance: Decimal,

    pub currency: String,

    pub status: String,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
