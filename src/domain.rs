//! Core domain types shared across service boundaries.
//!
//! Every status-like value is a closed enum; the string encoding used on
//! the log and in the store lives only in the `Display`/`FromStr` impls
//! here.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a payment as owned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentState {
    New,
    AuthPending,
    Authorized,
    Captured,
    Succeeded,
    Failed,
    Canceled,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::New => "NEW",
            PaymentState::AuthPending => "AUTH_PENDING",
            PaymentState::Authorized => "AUTHORIZED",
            PaymentState::Captured => "CAPTURED",
            PaymentState::Succeeded => "SUCCEEDED",
            PaymentState::Failed => "FAILED",
            PaymentState::Canceled => "CANCELED",
        }
    }

    /// Terminal rows never mutate again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PaymentState::Succeeded | PaymentState::Failed | PaymentState::Canceled
        )
    }

    /// Legal outbound edges of the transition graph.
    pub fn successors(&self) -> &'static [PaymentState] {
        match self {
            PaymentState::New => &[PaymentState::AuthPending],
            PaymentState::AuthPending => &[PaymentState::Authorized, PaymentState::Failed],
            PaymentState::Authorized => &[PaymentState::Captured],
            PaymentState::Captured => &[PaymentState::Succeeded],
            PaymentState::Succeeded | PaymentState::Failed | PaymentState::Canceled => &[],
        }
    }

    pub fn can_advance_to(&self, to: PaymentState) -> bool {
        self.successors().contains(&to)
    }
}

impl fmt::Display for PaymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEW" => Ok(PaymentState::New),
            "AUTH_PENDING" => Ok(PaymentState::AuthPending),
            "AUTHORIZED" => Ok(PaymentState::Authorized),
            "CAPTURED" => Ok(PaymentState::Captured),
            "SUCCEEDED" => Ok(PaymentState::Succeeded),
            "FAILED" => Ok(PaymentState::Failed),
            "CANCELED" => Ok(PaymentState::Canceled),
            other => Err(format!("unknown payment state: {other}")),
        }
    }
}

/// Outcome of a fraud consultation as recorded by the orchestrator.
///
/// The evaluator only ever replies `approve`, `deny`, or `manual_review`;
/// `timeout` is recorded by the orchestrator when no reply arrives in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudVerdict {
    Approve,
    Deny,
    ManualReview,
    Timeout,
}

impl FraudVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudVerdict::Approve => "approve",
            FraudVerdict::Deny => "deny",
            FraudVerdict::ManualReview => "manual_review",
            FraudVerdict::Timeout => "timeout",
        }
    }
}

impl fmt::Display for FraudVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FraudVerdict {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(FraudVerdict::Approve),
            "deny" => Ok(FraudVerdict::Deny),
            "manual_review" => Ok(FraudVerdict::ManualReview),
            "timeout" => Ok(FraudVerdict::Timeout),
            other => Err(format!("unknown fraud verdict: {other}")),
        }
    }
}

/// Side of a ledger posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "debit",
            EntryType::Credit => "credit",
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(EntryType::Debit),
            "credit" => Ok(EntryType::Credit),
            other => Err(format!("unknown entry type: {other}")),
        }
    }
}

/// Classification of a ledger account.
///
/// Customer accounts are the source side of a payment: they represent
/// funds pulled from outside the system and are the only account class
/// permitted to carry a negative balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Platform,
    Merchant,
    Customer,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Platform => "platform",
            AccountType::Merchant => "merchant",
            AccountType::Customer => "customer",
        }
    }

    pub fn allows_negative_balance(&self) -> bool {
        matches!(self, AccountType::Customer)
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "platform" => Ok(AccountType::Platform),
            "merchant" => Ok(AccountType::Merchant),
            "customer" => Ok(AccountType::Customer),
            other => Err(format!("unknown account type: {other}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_graph_matches_lifecycle() {
        use PaymentState::*;

        assert!(New.can_advance_to(AuthPending));
        assert!(AuthPending.can_advance_to(Authorized));
        assert!(AuthPending.can_advance_to(Failed));
        assert!(Authorized.can_advance_to(Captured));
        assert!(Captured.can_advance_to(Succeeded));

        // No shortcuts past authorization.
        assert!(!New.can_advance_to(Authorized));
        assert!(!New.can_advance_to(Succeeded));
        assert!(!AuthPending.can_advance_to(Captured));
        assert!(!AuthPending.can_advance_to(Succeeded));
        assert!(!Authorized.can_advance_to(Succeeded));
    }

    #[test]
    fn terminal_states_have_no_successors() {
        use PaymentState::*;

        for state in [Succeeded, Failed, Canceled] {
            assert!(state.is_terminal());
            assert!(state.successors().is_empty());
        }
        for state in [New, AuthPending, Authorized, Captured] {
            assert!(!state.is_terminal());
            assert!(!state.successors().is_empty());
        }
    }

    #[test]
    fn state_strings_round_trip() {
        use PaymentState::*;

        for state in [New, AuthPending, Authorized, Captured, Succeeded, Failed, Canceled] {
            assert_eq!(state.as_str().parse::<PaymentState>().unwrap(), state);
        }
        assert!("PENDING".parse::<PaymentState>().is_err());
    }

    #[test]
    fn verdict_serializes_in_wire_case() {
        let json = serde_json::to_string(&FraudVerdict::ManualReview).unwrap();
        assert_eq!(json, "\"manual_review\"");
        let back: FraudVerdict = serde_json::from_str("\"deny\"").unwrap();
        assert_eq!(back, FraudVerdict::Deny);
    }

    #[test]
    fn only_customer_accounts_may_go_negative() {
        assert!(AccountType::Customer.allows_negative_balance());
        assert!(!AccountType::Merchant.allows_negative_balance());
        assert!(!AccountType::Platform.allows_negative_balance());
    }
}
