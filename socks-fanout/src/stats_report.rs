//! Operator-facing statistics printing: consumes the stats snapshot
//! exposed by the registry and renders it two ways — a verbose
//! per-proxy table on `console_stats_interval` (or a one-line summary
//! when `compact_console_stats` is set), and a `tracing::info!` summary
//! on `stats_log_interval`.

use std::sync::Arc;
use std::time::Duration;

use fanout_registry::{Registry, RegistrySnapshot};
use tracing::info;

pub fn spawn_console_reporter(
    registry: Arc<Registry>,
    interval: Duration,
    compact: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snapshot = registry.snapshot();
            if compact {
                print_compact(&snapshot);
            } else {
                print_full(&snapshot);
            }
        }
    })
}

pub fn spawn_log_summary(registry: Arc<Registry>, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let snapshot = registry.snapshot();
            info!(
                target: "fanout::stats",
                selector = snapshot.selector,
                total_requests = snapshot.total_requests,
                total_successes = snapshot.total_successes,
                success_rate = %format!("{:.1}%", snapshot.success_rate * 100.0),
                proxies = snapshot.proxies.len(),
                "stats summary"
            );
        }
    })
}

fn print_full(snapshot: &RegistrySnapshot) {
    println!(
        "--- proxy fleet ({} proxies, selector={}) ---",
        snapshot.proxies.len(),
        snapshot.selector
    );
    for proxy in &snapshot.proxies {
        println!(
            "  {:<24} {:<12} reqs={:<6} ok={:<6} fail={:<6} 429={:<6} pool={}",
            proxy.key,
            proxy.state,
            proxy.stats.requests,
            proxy.stats.successes,
            proxy.stats.failures,
            proxy.stats.responses_429,
            proxy.pool_depth,
        );
    }
    println!(
        "  totals: requests={} successes={} success_rate={:.1}%",
        snapshot.total_requests,
        snapshot.total_successes,
        snapshot.success_rate * 100.0
    );
}

fn print_compact(snapshot: &RegistrySnapshot) {
    let available = snapshot.proxies.iter().filter(|p| p.state == "available").count();
    println!(
        "fanout: {}/{} available, {} req, {:.1}% success",
        available,
        snapshot.proxies.len(),
        snapshot.total_requests,
        snapshot.success_rate * 100.0
    );
}
