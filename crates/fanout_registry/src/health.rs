use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use crate::descriptor::ProxyDescriptor;
use crate::registry::Registry;

/// How many `Unavailable` descriptors the fast probe checks concurrently.
const FAST_PROBE_FANOUT: usize = 10;
/// How many descriptors the full sweep checks concurrently.
const FULL_SWEEP_FANOUT: usize = 20;
/// Connect timeout used by both the fast probe and the full sweep.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Background loop that keeps the Registry's view of the world current
/// without ever directly promoting or demoting `Available` descriptors
/// on its own judgement:
///
/// 1. On every tick, release any `Resting` descriptor whose timer has
///    elapsed, restoring it to `Available` regardless of why it was
///    resting.
/// 2. On every tick, fan out a fast, short-timeout TCP-connect probe
///    against every `Unavailable` descriptor; a descriptor that answers
///    is restored to `Available` (front-inserted).
/// 3. Once per `health_check_interval`, fan out a full sweep across
///    every configured descriptor. A failing probe only resets that
///    descriptor's consecutive-failure counter and bumps its
///    `health_failures` stat — it never flips an `Available` descriptor
///    to `Unavailable` itself. Only the dispatcher's own failure budget
///    does that, so a descriptor that is merely slow to answer a health
///    probe but still serving live traffic successfully is never
///    punished twice.
pub struct HealthChecker {
    registry: Arc<Registry>,
    tick_interval: Duration,
    full_sweep_interval: Duration,
    stop_tx: watch::Sender<bool>,
}

impl HealthChecker {
    pub fn new(registry: Arc<Registry>, tick_interval: Duration, full_sweep_interval: Duration) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            registry,
            tick_interval,
            full_sweep_interval,
            stop_tx,
        }
    }

    /// Spawn the background loop, returning a handle that can be
    /// stopped with [`HealthChecker::stop`].
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        let checker = Arc::clone(&self);
        tokio::spawn(async move {
            let mut since_full_sweep = Duration::ZERO;
            let mut ticker = tokio::time::interval(checker.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        checker.registry.release_expired_resting(Instant::now());
                        checker.probe_unavailable().await;

                        since_full_sweep += checker.tick_interval;
                        if since_full_sweep >= checker.full_sweep_interval {
                            since_full_sweep = Duration::ZERO;
                            checker.full_sweep().await;
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(target: "fanout::health", "health checker loop stopped");
        })
    }

    /// Signal the loop to stop and wait up to 5 seconds for it to join.
    pub async fn stop(&self, handle: tokio::task::JoinHandle<()>) {
        let _ = self.stop_tx.send(true);
        if timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!(target: "fanout::health", "health checker did not stop within 5s");
        }
    }

    #[instrument(skip(self))]
    async fn probe_unavailable(&self) {
        let targets = self.registry.unavailable_descriptors();
        if targets.is_empty() {
            return;
        }
        for chunk in targets.chunks(FAST_PROBE_FANOUT) {
            let futures = chunk.iter().map(|descriptor| self.probe_and_restore(descriptor.clone()));
            futures::future::join_all(futures).await;
        }
    }

    #[instrument(skip(self))]
    async fn full_sweep(&self) {
        let targets = self.registry.all_descriptors();
        for chunk in targets.chunks(FULL_SWEEP_FANOUT) {
            let futures = chunk.iter().map(|descriptor| self.probe_only(descriptor.clone()));
            futures::future::join_all(futures).await;
        }
    }

    async fn probe_and_restore(&self, descriptor: ProxyDescriptor) {
        if probe(&descriptor).await {
            debug!(target: "fanout::health", proxy = %descriptor.key(), "probe succeeded, restoring");
            self.registry.restore(&descriptor.key());
        }
    }

    async fn probe_only(&self, descriptor: ProxyDescriptor) {
        let key = descriptor.key();
        if probe(&descriptor).await {
            self.registry.reset_consecutive_failures(&key);
        } else if let Some(stats) = self.registry.stats_for(&key) {
            stats.record_health_failure();
        }
    }
}

async fn probe(descriptor: &ProxyDescriptor) -> bool {
    let addr = format!("{}:{}", descriptor.host, descriptor.port);
    matches!(timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await, Ok(Ok(_)))
}
