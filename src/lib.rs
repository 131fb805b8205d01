//! Payflow
//!
//! Four cooperating services around a payment lifecycle: an idempotent
//! ingress gateway, a state-machine orchestrator, a rules-based fraud
//! evaluator, and a double-entry ledger. Services share no memory; they
//! talk through a partitioned event log, a request/reply bus, and a
//! key-value store, each behind a trait with in-memory and Redis-backed
//! implementations.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod cache;
pub mod config;
pub mod db;
pub mod domain;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod health;
pub mod message_bus;
pub mod message_log;
pub mod metrics;
pub mod services;

use tokio::signal;

/// Resolves when SIGINT or SIGTERM is received.
///
/// Used by every service binary as the axum graceful-shutdown future and
/// as the trigger for draining background tasks.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
