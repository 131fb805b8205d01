use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Pending publication written in the same transaction as the business
/// row it announces. The integer key doubles as the drain order, so a
/// payment's state changes reach the log in the order they committed.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "outbox_events")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,

    pub topic: String,

    pub partition_key: String,

    #[sea_orm(column_type = "Json")]
    pub payload: Json,

    pub status: String,

    pub attempts: i32,

    pub available_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    pub processed_at: Option<DateTime<Utc>>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
