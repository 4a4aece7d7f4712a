//! Configuration schema, loading, validation, and hot-reload watching for
//! the SOCKS5-fronting forward proxy.
//!
//! A dedicated module per concern, re-exported flat from `lib.rs`, over
//! a JSON configuration document.

mod error;
mod loader;
mod schema;
mod validation;
mod watch;

pub use error::ConfigError;
pub use loader::{load, load_str};
pub use schema::{FanoutConfig, ProxyEntry, ServerSection};
pub use validation::{known_selector_name, validate};
pub use watch::watch_config;
