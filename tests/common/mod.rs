//! In-process test stack: all four services wired over in-memory
//! transport with private in-memory SQLite stores, mirroring the
//! deployed topology without any network.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rust_decimal_macros::dec;
use sea_orm::{Database, DatabaseConnection};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use payflow::cache::InMemoryKv;
use payflow::db;
use payflow::entities::payment_state;
use payflow::events::outbox::OutboxPublisher;
use payflow::message_bus::InMemoryBus;
use payflow::message_log::InMemoryEventLog;
use payflow::metrics::Metrics;
use payflow::services::fraud::{FraudRuleSet, FraudService};
use payflow::services::ledger::LedgerService;
use payflow::services::orchestrator::OrchestratorService;
use payflow::services::payments::PaymentService;

const PUBLISHER_POLL: Duration = Duration::from_millis(20);

/// A uniquely named shared-cache in-memory database: shared across the
/// pool's connections, private to this stack.
async fn mem_db(name: &str) -> Arc<DatabaseConnection> {
    let url = format!(
        "sqlite:file:{name}-{}?mode=memory&cache=shared",
        Uuid::new_v4().simple()
    );
    Arc::new(Database::connect(&url).await.unwrap())
}

pub struct StackOptions {
    /// Run the fraud responder; disable to exercise the timeout path.
    pub with_fraud_responder: bool,
    /// Run the orchestrator's stall sweeper.
    pub with_sweeper: bool,
    pub fraud_timeout: Duration,
    pub sweep_interval: Duration,
}

impl Default for StackOptions {
    fn default() -> Self {
        Self {
            with_fraud_responder: true,
            with_sweeper: false,
            fraud_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_millis(100),
        }
    }
}

pub struct TestStack {
    pub log: Arc<InMemoryEventLog>,
    pub bus: Arc<InMemoryBus>,
    pub kv: Arc<InMemoryKv>,
    pub payments: Arc<PaymentService>,
    pub orchestrator: Arc<OrchestratorService>,
    pub fraud: Arc<FraudService>,
    pub ledger: Arc<LedgerService>,
    pub gateway_db: Arc<DatabaseConnection>,
    pub orchestrator_db: Arc<DatabaseConnection>,
    pub fraud_db: Arc<DatabaseConnection>,
    pub ledger_db: Arc<DatabaseConnection>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl TestStack {
    pub async fn start() -> Self {
        Self::start_with(StackOptions::default()).await
    }

    pub async fn start_with(options: StackOptions) -> Self {
        let log = Arc::new(InMemoryEventLog::new());
        let bus = Arc::new(InMemoryBus::new());
        let kv = Arc::new(InMemoryKv::new());

        let gateway_db = mem_db("gateway").await;
        db::ensure_gateway_schema(&gateway_db).await.unwrap();
        let orchestrator_db = mem_db("orchestrator").await;
        db::ensure_orchestrator_schema(&orchestrator_db).await.unwrap();
        let fraud_db = mem_db("fraud").await;
        db::ensure_fraud_schema(&fraud_db).await.unwrap();
        let ledger_db = mem_db("ledger").await;
        db::ensure_ledger_schema(&ledger_db).await.unwrap();

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        // Ingress gateway with its outbox publisher.
        let gateway_notify = Arc::new(Notify::new());
        let payments = Arc::new(PaymentService::new(
            gateway_db.clone(),
            kv.clone(),
            gateway_notify.clone(),
            Arc::new(Metrics::new("api-gateway")),
        ));
        let gateway_publisher =
            OutboxPublisher::new(gateway_db.clone(), log.clone(), gateway_notify)
                .with_poll_interval(PUBLISHER_POLL);
        tasks.push(tokio::spawn(gateway_publisher.run(shutdown_rx.clone())));

        // Orchestrator: consumer, publisher, optional sweeper.
        let orchestrator_notify = Arc::new(Notify::new());
        let orchestrator = Arc::new(OrchestratorService::new(
            orchestrator_db.clone(),
            kv.clone(),
            bus.clone(),
            orchestrator_notify.clone(),
            Arc::new(Metrics::new("payment-orchestrator")),
            options.fraud_timeout,
            Duration::from_secs(30),
            options.sweep_interval,
            options.fraud_timeout * 2,
        ));
        let orchestrator_publisher =
            OutboxPublisher::new(orchestrator_db.clone(), log.clone(), orchestrator_notify)
                .with_poll_interval(PUBLISHER_POLL);
        tasks.push(tokio::spawn(orchestrator_publisher.run(shutdown_rx.clone())));
        tasks.push(tokio::spawn(
            orchestrator
                .clone()
                .run_consumer(log.clone(), shutdown_rx.clone()),
        ));
        if options.with_sweeper {
            tasks.push(tokio::spawn(
                orchestrator.clone().run_sweeper(shutdown_rx.clone()),
            ));
        }

        // Fraud evaluator.
        let fraud = Arc::new(FraudService::new(
            fraud_db.clone(),
            kv.clone(),
            FraudRuleSet::default(),
            Arc::new(Metrics::new("fraud-service")),
        ));
        fraud.bootstrap().await.unwrap();
        if options.with_fraud_responder {
            tasks.push(tokio::spawn(
                fraud.clone().run_responder(bus.clone(), shutdown_rx.clone()),
            ));
        }

        // Ledger.
        let ledger = Arc::new(LedgerService::new(
            ledger_db.clone(),
            dec!(2.00),
            Arc::new(Metrics::new("ledger-service")),
        ));
        ledger.bootstrap().await.unwrap();
        tasks.push(tokio::spawn(
            ledger.clone().run_consumer(log.clone(), shutdown_rx),
        ));

        Self {
            log,
            bus,
            kv,
            payments,
            orchestrator,
            fraud,
            ledger,
            gateway_db,
            orchestrator_db,
            fraud_db,
            ledger_db,
            shutdown,
            tasks,
        }
    }

    /// Polls until the payment's state row reaches `state`.
    pub async fn await_state(
        &self,
        payment_id: Uuid,
        state: &str,
        timeout: Duration,
    ) -> payment_state::Model {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Ok(row) = self.orchestrator.get_state(payment_id).await {
                if row.state == state {
                    return row;
                }
            }
            if tokio::time::Instant::now() > deadline {
                panic!("payment {payment_id} never reached state {state}");
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Polls until the ledger holds `count` entries for the payment.
    pub async fn await_entries(
        &self,
        payment_id: Uuid,
        count: usize,
        timeout: Duration,
    ) -> Vec<payflow::entities::ledger_entry::Model> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let entries = self.ledger.payment_entries(payment_id).await.unwrap();
            if entries.len() >= count {
                return entries;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "payment {payment_id} has {} ledger entries, expected {count}",
                    entries.len()
                );
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
