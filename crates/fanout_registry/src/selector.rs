use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;
use tracing::warn;

/// Polymorphic load-balancing policy. Implementations choose one entry
/// from the Registry's current `Available` list; the
/// Registry invokes `select` while already holding its selection lock,
/// so implementations must not block.
pub trait Selector: Send + Sync {
    fn select(&self, available: &[String]) -> Option<String>;
    fn reset(&self);
    fn name(&self) -> &'static str;
}

/// Uniform choice over the input list. `reset` is a no-op: there is no
/// internal cursor to rewind.
#[derive(Debug, Default)]
pub struct RandomSelector;

impl Selector for RandomSelector {
    fn select(&self, available: &[String]) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..available.len());
        Some(available[idx].clone())
    }

    fn reset(&self) {}

    fn name(&self) -> &'static str {
        "random"
    }
}

/// A monotonic cursor modulo the list length, held inside the selector
/// and updated atomically at each call. `reset` returns the cursor to 0
/// — invoked by `Registry::update_proxies` whenever the proxy set
/// changes.
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl Selector for RoundRobinSelector {
    fn select(&self, available: &[String]) -> Option<String> {
        if available.is_empty() {
            return None;
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % available.len();
        Some(available[idx].clone())
    }

    fn reset(&self) {
        self.cursor.store(0, Ordering::Relaxed);
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Case-insensitive factory mapping the configuration string
/// (`"random"` / `"round_robin"`) to a [`Selector`]. Unknown values fall
/// back to [`RandomSelector`] with a warning.
pub struct SelectorFactory;

impl SelectorFactory {
    pub fn create(name: &str) -> Box<dyn Selector> {
        match name.to_ascii_lowercase().as_str() {
            "round_robin" => Box::new(RoundRobinSelector::default()),
            "random" => Box::new(RandomSelector),
            other => {
                warn!(
                    target: "fanout::registry",
                    algorithm = %other,
                    "unknown load_balancing_algorithm, falling back to random"
                );
                Box::new(RandomSelector)
            }
        }
    }
}
