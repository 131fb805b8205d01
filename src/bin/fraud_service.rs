//! Fraud evaluator: replies to `fraud.check` requests with the rule
//! chain verdict and appends every decision to the audit table.

use std::sync::Arc;
use std::time::Duration;

use axum::{routing::get, Router};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use payflow::{
    cache::RedisKv,
    config,
    db,
    handlers::fraud::{routes, FraudApiState},
    health::{self, HealthState},
    message_bus::RedisBus,
    metrics::{metrics_handler, Metrics},
    services::fraud::{FraudRuleSet, FraudService},
    shutdown_signal,
};

const SERVICE: &str = "fraud-service";
const DEFAULT_PORT: u16 = 8083;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config(DEFAULT_PORT)?;
    config::init_tracing(&config.log_level);
    info!("starting {SERVICE}");

    let db = Arc::new(db::establish_connection(&config).await?);
    db::ensure_fraud_schema(&db).await?;

    let kv = Arc::new(RedisKv::connect(&config.redis_url)?);
    let bus = Arc::new(RedisBus::connect(&config.nats_url)?);
    let metrics = Arc::new(Metrics::new(SERVICE));

    let rules = FraudRuleSet {
        amount_ceiling: config.amount_ceiling,
        velocity_limit: config.velocity_limit,
        review_threshold: config.review_threshold,
    };
    let fraud = Arc::new(FraudService::new(db.clone(), kv, rules, metrics.clone()));
    fraud.bootstrap().await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![tokio::spawn(
        fraud.clone().run_responder(bus, shutdown_rx),
    )];

    let app = Router::new()
        .merge(routes(FraudApiState { fraud }))
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
