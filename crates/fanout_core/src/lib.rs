//! The traffic-routing engine: request dispatch, `CONNECT` handling,
//! and the listener/worker pool that ties them to incoming client
//! connections.
//!
//! Owns connection-level orchestration and depends on `fanout_http` for
//! wire parsing and `fanout_registry` for proxy-pool state, but never
//! the reverse.

pub mod connect;
pub mod dispatcher;
pub mod error;
pub mod io;
pub mod listener;
pub mod upstream_tls;

pub use connect::{load_tls_acceptor, ConnectHandler};
pub use dispatcher::Dispatcher;
pub use error::ProxyError;
pub use listener::{Listener, DEFAULT_MAX_CONNECTIONS};
