//! Wire-level event and bus payloads.
//!
//! Log topics are keyed by payment id, which pins every event of one
//! payment to a single partition and preserves its order end to end.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{FraudVerdict, PaymentState};

pub mod outbox;

/// Topic announcing freshly accepted payment intents.
pub const TOPIC_PAYMENT_CREATED: &str = "payment.created";
/// Topic announcing every committed state transition.
pub const TOPIC_PAYMENT_STATE_CHANGED: &str = "payment.state.changed";
/// Bus subject for synchronous fraud consultation.
pub const SUBJECT_FRAUD_CHECK: &str = "fraud.check";

/// Where non-retryable deliveries of a topic are parked.
pub fn dead_letter_topic(topic: &str) -> String {
    format!("{topic}.dlq")
}

/// Emitted by the gateway when an intent is accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentCreatedEvent {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub merchant_id: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Emitted by the orchestrator after each committed transition.
///
/// Carries the intent snapshot so downstream consumers (the ledger in
/// particular) can post the payment's real amount without a lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentStateChangedEvent {
    pub payment_id: Uuid,
    pub state: PaymentState,
    pub previous_state: PaymentState,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub merchant_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Bus request sent by the orchestrator on `fraud.check`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudCheckRequest {
    pub payment_id: Uuid,
    pub amount: Decimal,
    pub customer_id: String,
}

/// Bus reply from the fraud evaluator. The evaluator never replies
/// `timeout`; that verdict exists only on the orchestrator's side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudCheckReply {
    pub decision: FraudVerdict,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn state_changed_event_uses_wire_state_names() {
        let event = PaymentStateChangedEvent {
            payment_id: Uuid::new_v4(),
            state: PaymentState::AuthPending,
            previous_state: PaymentState::New,
            amount: dec!(50.00),
            currency: "USD".to_string(),
            customer_id: "C1".to_string(),
            merchant_id: "M1".to_string(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["state"], "AUTH_PENDING");
        assert_eq!(json["previous_state"], "NEW");
        assert_eq!(json["amount"], "50.00");
    }

    #[test]
    fn fraud_reply_decision_is_snake_case() {
        let reply = FraudCheckReply {
            decision: FraudVerdict::ManualReview,
            reason: "high value".to_string(),
        };
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["decision"], "manual_review");
    }

    #[test]
    fn dead_letter_topic_appends_suffix() {
        assert_eq!(
            dead_letter_topic(TOPIC_PAYMENT_CREATED),
            "payment.created.dlq"
        );
    }
}
