//! In-process metrics with OpenMetrics text rendering.
//!
//! One `Metrics` value per service, threaded through constructors and
//! served at `/metrics`. Counters are plain atomics; there is no
//! registry machinery because the counter set is closed.

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct Metrics {
    service: &'static str,
    pub payments_created: Counter,
    pub payments_replayed: Counter,
    pub state_transitions: Counter,
    pub fraud_approvals: Counter,
    pub fraud_denials: Counter,
    pub fraud_manual_reviews: Counter,
    pub fraud_timeouts: Counter,
    pub ledger_entries_posted: Counter,
    pub ledger_duplicates: Counter,
    pub consumer_errors: Counter,
}

impl Metrics {
    pub fn new(service: &'static str) -> Self {
        Self {
            service,
            payments_created: Counter::new(),
            payments_replayed: Counter::new(),
            state_transitions: Counter::new(),
            fraud_approvals: Counter::new(),
            fraud_denials: Counter::new(),
            fraud_manual_reviews: Counter::new(),
            fraud_timeouts: Counter::new(),
            ledger_entries_posted: Counter::new(),
            ledger_duplicates: Counter::new(),
            consumer_errors: Counter::new(),
        }
    }

    /// Renders the counter set in OpenMetrics text format.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, counter) in [
            ("payments_created", &self.payments_created),
            ("payments_replayed", &self.payments_replayed),
            ("state_transitions", &self.state_transitions),
            ("fraud_approvals", &self.fraud_approvals),
            ("fraud_denials", &self.fraud_denials),
            ("fraud_manual_reviews", &self.fraud_manual_reviews),
            ("fraud_timeouts", &self.fraud_timeouts),
            ("ledger_entries_posted", &self.ledger_entries_posted),
            ("ledger_duplicates", &self.ledger_duplicates),
            ("consumer_errors", &self.consumer_errors),
        ] {
            let _ = writeln!(out, "# TYPE payflow_{name}_total counter");
            let _ = writeln!(
                out,
                "payflow_{name}_total{{service=\"{}\"}} {}",
                self.service,
                counter.get()
            );
        }
        out.push_str("# EOF\n");
        out
    }
}

/// Axum handler serving the OpenMetrics exposition.
pub async fn metrics_handler(State(metrics): State<Arc<Metrics>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/openmetrics-text; version=1.0.0; charset=utf-8",
        )],
        metrics.render(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_reports_counts_with_service_label() {
        let metrics = Metrics::new("api-gateway");
        metrics.payments_created.inc();
        metrics.payments_created.inc();
        metrics.state_transitions.add(5);

        let text = metrics.render();
        assert!(text.contains("payflow_payments_created_total{service=\"api-gateway\"} 2"));
        assert!(text.contains("payflow_state_transitions_total{service=\"api-gateway\"} 5"));
        assert!(text.ends_with("# EOF\n"));
    }
}
