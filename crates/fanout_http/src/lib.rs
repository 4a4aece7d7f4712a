//! Low-level HTTP/1.1 primitives shared by the listener, dispatcher, and
//! `CONNECT` handler: request-line/header parsing, header hygiene, and
//! status-line/response writers.
//!
//! A dependency-light crate the higher-level listener/dispatcher crate
//! builds on, scoped to what a forward proxy needs: reconstructing an
//! absolute target URL, not location routing.

pub mod headers;
pub mod request;
pub mod responses;

pub use request::{parse_connect_target, parse_head, ConnectParseError, RequestHead};
