//! SeaORM entities, one table per owning service.
//!
//! Gateway: `payment`, `outbox_event`. Orchestrator: `payment_state`,
//! `outbox_event`. Fraud: `fraud_decision`, `fraud_rule`. Ledger:
//! `account`, `ledger_entry`. Each service opens its own logical
//! database; nothing is shared across schemas.

pub mod account;
pub mod fraud_decision;
pub mod fraud_rule;
pub mod ledger_entry;
pub mod outbox_event;
pub mod payment;
pub mod payment_state;
