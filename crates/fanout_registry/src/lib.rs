mod descriptor;
mod health;
mod pool;
mod registry;
mod selector;
mod state;
mod stats;

pub use descriptor::ProxyDescriptor;
pub use health::HealthChecker;
pub use pool::{PooledClient, SessionPool, UpstreamStream};
pub use registry::{ProxyHandle, ProxyStatusSnapshot, Registry, RegistrySnapshot};
pub use selector::{RandomSelector, RoundRobinSelector, Selector, SelectorFactory};
pub use state::{ProxyState, RestReason};
pub use stats::{ProxyStats, ProxyStatsSnapshot};
