use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    pub requests: u64,
    pub invalid_keys: u64,
    pub unsupported_models: u64,
    pub rate_limited: u64,
    pub upstream_calls: u64,
    pub upstream_errors: u64,
    pub insufficient_funds: u64,
    pub ledger_errors: u64,
    pub debits: u64,
}

/// Lock-free counters shared by every in-flight request.
#[derive(Debug, Default)]
pub struct Observability {
    requests: AtomicU64,
    invalid_keys: AtomicU64,
    unsupported_models: AtomicU64,
    rate_limited: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_errors: AtomicU64,
    insufficient_funds: AtomicU64,
    ledger_errors: AtomicU64,
    debits: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Observability {
    pub fn record_request(&self) {
        bump(&self.requests);
    }

    pub fn record_invalid_key(&self) {
        bump(&self.invalid_keys);
    }

    pub fn record_unsupported_model(&self) {
        bump(&self.unsupported_models);
    }

    pub fn record_rate_limited(&self) {
        bump(&self.rate_limited);
    }

    pub fn record_upstream_call(&self) {
        bump(&self.upstream_calls);
    }

    pub fn record_upstream_error(&self) {
        bump(&self.upstream_errors);
    }

    pub fn record_insufficient_funds(&self) {
        bump(&self.insufficient_funds);
    }

    pub fn record_ledger_error(&self) {
        bump(&self.ledger_errors);
    }

    pub fn record_debit(&self) {
        bump(&self.debits);
    }

    pub fn snapshot(&self) -> ObservabilitySnapshot {
        ObservabilitySnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            invalid_keys: self.invalid_keys.load(Ordering::Relaxed),
            unsupported_models: self.unsupported_models.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            upstream_calls: self.upstream_calls.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            insufficient_funds: self.insufficient_funds.load(Ordering::Relaxed),
            ledger_errors: self.ledger_errors.load(Ordering::Relaxed),
            debits: self.debits.load(Ordering::Relaxed),
        }
    }
}
