//! HTTP routers, one module per service surface.

pub mod fraud;
pub mod ledger;
pub mod payment_state;
pub mod payments;
