//! Database connection pool and schema bootstrap.
//!
//! Each service owns a private logical database. Production migrations
//! are managed outside the binaries; `ensure_*_schema` creates the
//! service's tables if they are missing so dev and test environments
//! come up without an external migration step.

use sea_orm::sea_query::TableCreateStatement;
use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbErr, Schema};
use std::time::Duration;
use tracing::debug;

use crate::config::AppConfig;
use crate::entities::{
    account, fraud_decision, fraud_rule, ledger_entry, outbox_event, payment, payment_state,
};

pub type DbPool = DatabaseConnection;

/// Establishes the pooled connection described by the configuration.
pub async fn establish_connection(config: &AppConfig) -> Result<DbPool, DbErr> {
    let mut opt = ConnectOptions::new(config.database_url.clone());
    opt.max_connections(config.db_max_connections)
        .min_connections(config.db_min_connections)
        .connect_timeout(Duration::from_secs(config.db_connect_timeout_secs))
        .sqlx_logging(false);

    debug!("connecting to database");
    Database::connect(opt).await
}

async fn create_table_if_missing<E>(db: &DatabaseConnection, entity: E) -> Result<(), DbErr>
where
    E: sea_orm::EntityTrait,
{
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);
    let mut statement: TableCreateStatement = schema.create_table_from_entity(entity);
    statement.if_not_exists();
    db.execute(backend.build(&statement)).await?;
    Ok(())
}

/// Tables owned by the ingress gateway.
pub async fn ensure_gateway_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table_if_missing(db, payment::Entity).await?;
    create_table_if_missing(db, outbox_event::Entity).await?;
    Ok(())
}

/// Tables owned by the orchestrator.
pub async fn ensure_orchestrator_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table_if_missing(db, payment_state::Entity).await?;
    create_table_if_missing(db, outbox_event::Entity).await?;
    Ok(())
}

/// Tables owned by the fraud evaluator.
pub async fn ensure_fraud_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table_if_missing(db, fraud_decision::Entity).await?;
    create_table_if_missing(db, fraud_rule::Entity).await?;
    Ok(())
}

/// Tables owned by the ledger.
pub async fn ensure_ledger_schema(db: &DatabaseConnection) -> Result<(), DbErr> {
    create_table_if_missing(db, account::Entity).await?;
    create_table_if_missing(db, ledger_entry::Entity).await?;
    Ok(())
}
