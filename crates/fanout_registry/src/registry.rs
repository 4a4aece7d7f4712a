use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::descriptor::ProxyDescriptor;
use crate::pool::SessionPool;
use crate::selector::{Selector, SelectorFactory};
use crate::state::{ProxyState, RestReason};
use crate::stats::{ProxyStats, ProxyStatsSnapshot};

/// Everything the Registry owns for one descriptor. Stats and the
/// session pool are reference-counted and handed out to callers as
/// `Arc` clones so that I/O against them never needs to hold the
/// Registry's selection lock — that lock is held across selection and
/// membership mutation only, never across network I/O.
struct ProxyRecord {
    descriptor: ProxyDescriptor,
    state: ProxyState,
    consecutive_failures: u32,
    overload_streak: u32,
    stats: Arc<ProxyStats>,
    pool: Arc<SessionPool>,
}

impl ProxyRecord {
    fn new(descriptor: ProxyDescriptor, pool_max: usize) -> Self {
        Self {
            descriptor,
            state: ProxyState::Available,
            consecutive_failures: 0,
            overload_streak: 0,
            stats: Arc::new(ProxyStats::default()),
            pool: Arc::new(SessionPool::new(pool_max)),
        }
    }
}

struct RegistryInner {
    /// The `Available` list, in insertion order; restoration inserts at
    /// the front.
    available_order: Vec<String>,
    records: HashMap<String, ProxyRecord>,
    selector: Box<dyn Selector>,
}

/// Everything a caller needs to act on a selected proxy: its descriptor,
/// and `Arc` handles to its stats and session pool, obtained under the
/// selection lock and usable without it afterwards.
#[derive(Clone)]
pub struct ProxyHandle {
    pub descriptor: ProxyDescriptor,
    pub stats: Arc<ProxyStats>,
    pub pool: Arc<SessionPool>,
}

/// The proxy pool's state machine and selection policy. All transitions
/// acquire a single exclusive lock (the "selection lock") so the
/// `Available` list and every state tag stay coherent — one
/// `Mutex<RegistryInner>` across the whole list rather than independent
/// per-key locks, since selection has to see a consistent view of which
/// descriptors are currently eligible.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    max_retries: u32,
    overload_backoff_base: Duration,
    pool_max: usize,
}

impl Registry {
    pub fn new(
        descriptors: Vec<ProxyDescriptor>,
        selector_name: &str,
        max_retries: u32,
        overload_backoff_base_secs: f64,
        pool_max: usize,
    ) -> Self {
        let mut available_order = Vec::with_capacity(descriptors.len());
        let mut records = HashMap::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let key = descriptor.key();
            available_order.push(key.clone());
            records.insert(key, ProxyRecord::new(descriptor, pool_max));
        }

        Self {
            inner: Mutex::new(RegistryInner {
                available_order,
                records,
                selector: SelectorFactory::create(selector_name),
            }),
            max_retries: max_retries.max(1),
            overload_backoff_base: Duration::from_secs_f64(overload_backoff_base_secs.max(0.0)),
            pool_max,
        }
    }

    /// Replace the configured set of proxies. Descriptors whose key
    /// survives keep their state, stats, and pool; descriptors that are
    /// gone are dropped (draining and closing their pooled sessions).
    /// New descriptors start `Available`. The selector is reset.
    #[instrument(skip(self, new_descriptors), fields(count = new_descriptors.len()))]
    pub fn update_proxies(&self, new_descriptors: Vec<ProxyDescriptor>) {
        let mut inner = self.inner.lock().unwrap();

        let new_keys: std::collections::HashSet<String> =
            new_descriptors.iter().map(|d| d.key()).collect();

        let removed_keys: Vec<String> = inner
            .records
            .keys()
            .filter(|k| !new_keys.contains(*k))
            .cloned()
            .collect();

        for key in &removed_keys {
            if let Some(record) = inner.records.remove(key) {
                record.pool.drain();
                info!(target: "fanout::registry", proxy = %key, "removed proxy, pool drained");
            }
        }
        inner.available_order.retain(|k| !removed_keys.contains(k));

        for descriptor in new_descriptors {
            let key = descriptor.key();
            if let Some(record) = inner.records.get_mut(&key) {
                record.descriptor = descriptor;
            } else {
                inner.available_order.push(key.clone());
                inner
                    .records
                    .insert(key, ProxyRecord::new(descriptor, self.pool_max));
            }
        }

        inner.selector.reset();
    }

    /// Select one currently-`Available` descriptor per the configured
    /// selector. Returns `None` when nothing is available, which the
    /// caller reports as `NoAvailableProxy`.
    ///
    /// Deliberately just the plain lock-select-lookup sequence: any
    /// "probe on the hot path before returning a candidate" logic is
    /// optional embellishment, not part of this method's contract, so
    /// it stays out.
    pub fn get_next(&self) -> Option<ProxyHandle> {
        let inner = self.inner.lock().unwrap();
        let key = inner.selector.select(&inner.available_order)?;
        inner.records.get(&key).map(|record| ProxyHandle {
            descriptor: record.descriptor.clone(),
            stats: Arc::clone(&record.stats),
            pool: Arc::clone(&record.pool),
        })
    }

    /// Resets `consecutive_failures` and `overload_streak`; if the
    /// descriptor is not `Available`, transitions it there (front-insert).
    pub fn mark_success(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.records.get_mut(key) else {
            return;
        };
        record.consecutive_failures = 0;
        record.overload_streak = 0;
        if !record.state.is_available() {
            record.state = ProxyState::Available;
            drop(record);
            front_insert(&mut inner.available_order, key);
        }
    }

    /// Increments `consecutive_failures`; if the descriptor is
    /// `Available` and the count reaches `max_retries`, transitions it
    /// to `Unavailable`.
    pub fn mark_failure(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.records.get_mut(key) else {
            return;
        };
        record.consecutive_failures += 1;
        let should_demote = record.state.is_available() && record.consecutive_failures >= self.max_retries;
        if should_demote {
            record.state = ProxyState::Unavailable;
            warn!(target: "fanout::registry", proxy = %key, failures = record.consecutive_failures, "proxy marked unavailable");
            drop(record);
            inner.available_order.retain(|k| k != key);
        }
    }

    /// If the descriptor is `Available`, moves it to `Resting` with a
    /// backoff that grows with its overload streak.
    pub fn mark_overloaded(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.records.get_mut(key) else {
            return;
        };
        if !record.state.is_available() {
            return;
        }
        record.overload_streak += 1;
        let backoff = self.overload_backoff_base * record.overload_streak;
        record.state = ProxyState::Resting {
            until: Instant::now() + backoff,
            reason: RestReason::Overloaded,
        };
        debug!(target: "fanout::registry", proxy = %key, streak = record.overload_streak, backoff_secs = backoff.as_secs_f64(), "proxy resting after overload");
        drop(record);
        inner.available_order.retain(|k| k != key);
    }

    /// Forces `Available`, resetting `consecutive_failures` and
    /// `overload_streak`. This is the health checker's "probe succeeded
    /// on an `Unavailable` descriptor" transition (spec: reset both
    /// counters on that path) as well as an operator-forced restore;
    /// releasing a `Resting` descriptor whose timer simply expired goes
    /// through [`Registry::release_expired_resting`] instead, which
    /// deliberately retains the streak.
    pub fn restore(&self, key: &str) {
        let mut inner = self.inner.lock().unwrap();
        let Some(record) = inner.records.get_mut(key) else {
            return;
        };
        record.consecutive_failures = 0;
        record.overload_streak = 0;
        let was_available = record.state.is_available();
        record.state = ProxyState::Available;
        drop(record);
        if !was_available {
            front_insert(&mut inner.available_order, key);
        }
    }

    /// Releases every `Resting` descriptor whose `until` has passed,
    /// unconditionally of `reason`. Invoked by the health checker on
    /// every tick.
    pub fn release_expired_resting(&self, now: Instant) {
        let mut inner = self.inner.lock().unwrap();
        let expired: Vec<String> = inner
            .records
            .iter()
            .filter_map(|(key, record)| match &record.state {
                ProxyState::Resting { until, .. } if *until <= now => Some(key.clone()),
                _ => None,
            })
            .collect();

        for key in &expired {
            if let Some(record) = inner.records.get_mut(key) {
                record.state = ProxyState::Available;
            }
            front_insert(&mut inner.available_order, key);
        }
    }

    /// All configured descriptors, regardless of state.
    pub fn all_descriptors(&self) -> Vec<ProxyDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner.records.values().map(|r| r.descriptor.clone()).collect()
    }

    /// Descriptors currently `Unavailable`, for the health checker's
    /// fast probe.
    pub fn unavailable_descriptors(&self) -> Vec<ProxyDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .values()
            .filter(|r| matches!(r.state, ProxyState::Unavailable))
            .map(|r| r.descriptor.clone())
            .collect()
    }

    /// Number of descriptors currently `Available`, used by the
    /// dispatcher to decide between `429` and `503` on retry exhaustion.
    pub fn available_count(&self) -> usize {
        self.inner.lock().unwrap().available_order.len()
    }

    pub fn stats_for(&self, key: &str) -> Option<Arc<ProxyStats>> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(key)
            .map(|r| Arc::clone(&r.stats))
    }

    pub fn pool_for(&self, key: &str) -> Option<Arc<SessionPool>> {
        self.inner
            .lock()
            .unwrap()
            .records
            .get(key)
            .map(|r| Arc::clone(&r.pool))
    }

    /// Clear `consecutive_failures` without touching the state tag;
    /// used by the health checker's full sweep on probe failure, which
    /// deliberately never demotes an `Available` proxy itself. Only the
    /// dispatcher's own failure budget does that.
    pub fn reset_consecutive_failures(&self, key: &str) {
        if let Some(record) = self.inner.lock().unwrap().records.get_mut(key) {
            record.consecutive_failures = 0;
        }
    }

    /// A point-in-time snapshot for reporting and logging.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let inner = self.inner.lock().unwrap();
        let mut proxies = Vec::with_capacity(inner.records.len());
        let mut total_requests = 0u64;
        let mut total_successes = 0u64;

        for (key, record) in &inner.records {
            let stats = record.stats.snapshot();
            total_requests += stats.requests;
            total_successes += stats.successes;
            proxies.push(ProxyStatusSnapshot {
                key: key.clone(),
                host: record.descriptor.host.clone(),
                port: record.descriptor.port,
                state: record.state.label(),
                pool_depth: record.pool.depth(),
                stats,
            });
        }

        RegistrySnapshot {
            selector: inner.selector.name(),
            total_requests,
            total_successes,
            success_rate: if total_requests == 0 {
                0.0
            } else {
                total_successes as f64 / total_requests as f64
            },
            proxies,
        }
    }
}

fn front_insert(order: &mut Vec<String>, key: &str) {
    if !order.iter().any(|k| k == key) {
        order.insert(0, key.to_string());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProxyStatusSnapshot {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub state: &'static str,
    pub pool_depth: usize,
    pub stats: ProxyStatsSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub selector: &'static str,
    pub total_requests: u64,
    pub total_successes: u64,
    pub success_rate: f64,
    pub proxies: Vec<ProxyStatusSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(host: &str, port: u16) -> ProxyDescriptor {
        ProxyDescriptor {
            host: host.to_string(),
            port,
            username: None,
            password: None,
        }
    }

    fn registry(n: usize) -> Registry {
        let descriptors = (0..n).map(|i| descriptor("10.0.0.1", 1080 + i as u16)).collect();
        Registry::new(descriptors, "round_robin", 3, 30.0, 20)
    }

    #[test]
    fn every_descriptor_is_in_exactly_one_state() {
        let reg = registry(3);
        let key = reg.get_next().unwrap().descriptor.key();
        reg.mark_failure(&key);
        reg.mark_failure(&key);
        reg.mark_failure(&key);
        let snap = reg.snapshot();
        let unavailable = snap.proxies.iter().filter(|p| p.state == "unavailable").count();
        assert_eq!(unavailable, 1);
    }

    #[test]
    fn failure_budget_demotes_to_unavailable_after_max_retries() {
        let reg = registry(1);
        let key = reg.all_descriptors()[0].key();
        reg.mark_failure(&key);
        reg.mark_failure(&key);
        assert_eq!(reg.available_count(), 1);
        reg.mark_failure(&key);
        assert_eq!(reg.available_count(), 0);
    }

    #[test]
    fn success_resets_failure_counter_and_restores_availability() {
        let reg = registry(1);
        let key = reg.all_descriptors()[0].key();
        reg.mark_failure(&key);
        reg.mark_failure(&key);
        reg.mark_success(&key);
        reg.mark_failure(&key);
        reg.mark_failure(&key);
        // two failures post-reset should not yet demote (max_retries=3)
        assert_eq!(reg.available_count(), 1);
    }

    #[test]
    fn overload_backoff_is_monotonically_non_decreasing() {
        let reg = registry(1);
        let key = reg.all_descriptors()[0].key();

        reg.mark_overloaded(&key);
        let first_until = resting_until(&reg, &key);

        // Let the rest timer expire (streak retained, per
        // `release_expired_resting`'s contract) and overload it again;
        // the streak must have grown, so the second backoff must be at
        // least as long as the first.
        reg.release_expired_resting(Instant::now() + Duration::from_secs(3600));
        reg.mark_overloaded(&key);
        let second_until = resting_until(&reg, &key);

        assert!(second_until >= first_until);
    }

    /// Test-only: reaches into the private state to read the raw
    /// `Resting.until` that the public `snapshot()` deliberately doesn't
    /// expose (an `Instant` isn't meaningfully serializable).
    fn resting_until(reg: &Registry, key: &str) -> Instant {
        let inner = reg.inner.lock().unwrap();
        match &inner.records.get(key).expect("key present").state {
            ProxyState::Resting { until, .. } => *until,
            other => panic!("expected Resting, got {other:?}"),
        }
    }

    #[test]
    fn update_proxies_preserves_state_for_surviving_descriptors() {
        let reg = registry(2);
        let descriptors = reg.all_descriptors();
        let survivor = descriptors[0].clone();
        let removed = descriptors[1].clone();
        let key = survivor.key();
        reg.mark_failure(&key);
        reg.mark_failure(&key);
        reg.mark_failure(&key);
        assert_eq!(reg.available_count(), 1);

        reg.update_proxies(vec![survivor.clone()]);
        let snap = reg.snapshot();
        assert_eq!(snap.proxies.len(), 1);
        assert_eq!(snap.proxies[0].state, "unavailable");
        assert!(reg.stats_for(&removed.key()).is_none());
    }

    #[test]
    fn release_expired_resting_restores_regardless_of_reason() {
        let reg = registry(1);
        let key = reg.all_descriptors()[0].key();
        reg.mark_overloaded(&key);
        assert_eq!(reg.available_count(), 0);
        reg.release_expired_resting(Instant::now() + Duration::from_secs(3600));
        assert_eq!(reg.available_count(), 1);
    }
}
