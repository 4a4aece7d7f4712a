use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic per-proxy counters. A plain struct of independent atomics
/// rather than one lock: a single descriptor's counters are updated
/// together from the dispatcher's hot path but never need to block a
/// concurrent reader (the stats snapshot, the console reporter).
#[derive(Debug, Default)]
pub struct ProxyStats {
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    overloads: AtomicU64,
    responses_200: AtomicU64,
    responses_429: AtomicU64,
    responses_other: AtomicU64,
    /// Observability-only counter bumped by the health checker's full
    /// sweep failures — never drives a state transition on its own.
    health_failures: AtomicU64,
}

impl ProxyStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overload(&self) {
        self.overloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status(&self, status: u16) {
        match status {
            200 => {
                self.responses_200.fetch_add(1, Ordering::Relaxed);
            }
            429 => {
                self.responses_429.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.responses_other.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn record_health_failure(&self) {
        self.health_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProxyStatsSnapshot {
        ProxyStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            overloads: self.overloads.load(Ordering::Relaxed),
            responses_200: self.responses_200.load(Ordering::Relaxed),
            responses_429: self.responses_429.load(Ordering::Relaxed),
            responses_other: self.responses_other.load(Ordering::Relaxed),
            health_failures: self.health_failures.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`ProxyStats`], serializable for the stats
/// snapshot exposed to the console and log reporters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProxyStatsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub overloads: u64,
    pub responses_200: u64,
    pub responses_429: u64,
    pub responses_other: u64,
    pub health_failures: u64,
}

impl ProxyStatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.successes as f64 / self.requests as f64
    }
}
