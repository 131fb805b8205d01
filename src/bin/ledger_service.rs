//! Ledger service: consumes `payment.state.changed` and posts balanced,
//! idempotent entry groups for settled payments.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use payflow::{
    config,
    db,
    handlers::ledger::{routes, LedgerApiState},
    health::{self, HealthState},
    message_log::RedisEventLog,
    metrics::{metrics_handler, Metrics},
    services::ledger::LedgerService,
    shutdown_signal,
};

const SERVICE: &str = "ledger-service";
const DEFAULT_PORT: u16 = 8084;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config(DEFAULT_PORT)?;
    config::init_tracing(&config.log_level);
    info!("starting {SERVICE}");

    let db = Arc::new(db::establish_connection(&config).await?);
    db::ensure_ledger_schema(&db).await?;

    let log: Arc<RedisEventLog> = Arc::new(RedisEventLog::connect(&config.kafka_brokers).await?);
    let metrics = Arc::new(Metrics::new(SERVICE));

    let ledger = Arc::new(LedgerService::new(
        db.clone(),
        config.platform_fee,
        metrics.clone(),
    ));
    ledger.bootstrap().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![tokio::spawn(
        ledger.clone().run_consumer(log, shutdown_rx),
    )];

    let app = Router::new()
        .merge(routes(LedgerApiState { ledger }))
        .merge(health::routes(HealthState::new(db.clone(), SERVICE)))
        .route("/metrics", get(metrics_handler).with_state(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(30))),
        );

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("{SERVICE} listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(
        SHUTDOWN_GRACE,
        futures::future::join_all(tasks.iter_mut()),
    )
    .await
    .is_err()
    {
        warn!("background tasks did not drain in time, aborting");
        for task in &tasks {
            task.abort();
        }
    }
    info!("{SERVICE} stopped");
    Ok(())
}
