//! Payment orchestrator: consumes `payment.created`, owns the per-payment
//! state machine, consults the fraud evaluator synchronously, and emits
//! `payment.state.changed` through the transactional outbox.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::sync::{watch, Notify};
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use payflow::{
    cache::RedisKv,
    config,
    db,
    events::outbox::OutboxPublisher,
    handlers::payment_state::{routes, StateApiState},
    health::{self, HealthState},
    message_bus::RedisBus,
    message_log::RedisEventLog,
    metrics::{metrics_handler, Metrics},
    services::orchestrator::OrchestratorService,
    shutdown_signal,
};

const SERVICE: &str = "payment-orchestrator";
const DEFAULT_PORT: u16 = 8082;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config(DEFAULT_PORT)?;
    config::init_tracing(&config.log_level);
    info!("starting {SERVICE}");

    let db = Arc::new(db::establish_connection(&config).await?);
    db::ensure_orchestrator_schema(&db).await?;

    let kv = Arc::new(RedisKv::connect(&config.redis_url)?);
    let bus = Arc::new(RedisBus::connect(&config.nats_url)?);
    let log: Arc<RedisEventLog> = Arc::new(RedisEventLog::connect(&config.kafka_brokers).await?);
    let metrics = Arc::new(Metrics::new(SERVICE));
    let outbox_notify = Arc::new(Notify::new());

    let orchestrator = Arc::new(OrchestratorService::new(
        db.clone(),
        kv,
        bus,
        outbox_notify.clone(),
        metrics.clone(),
        config.fraud_timeout(),
        config.lock_ttl(),
        config.sweep_interval(),
        config.stuck_threshold(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let publisher = OutboxPublisher::new(db.clone(), log.clone(), outbox_notify);
    let mut tasks = vec![
        tokio::spawn(publisher.run(shutdown_rx.clone())),
        tokio::spawn(orchestrator.clone().run_consumer(log, shutdown_rx.clone())),
        tokio::spawn(orchestrator.clone().run_sweeper(shutdown_rx)),
    ];

    let app = Router::new()
        .merge(routes(StateApiState { orchestrator }))
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
