use socks5_client::Socks5Error;
use thiserror::Error;

/// Failure modes the traffic-routing engine distinguishes internally.
/// Only [`ProxyError::NoAvailableProxy`] and terminal retry exhaustion
/// ever reach a client, and then only as a bare status line with a
/// generic body — everything else is recovered locally (retried on a
/// different upstream, logged) and never serialized back over the wire.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("no proxy currently available")]
    NoAvailableProxy,
    #[error("failed to connect through upstream: {0}")]
    UpstreamConnectFailure(#[from] Socks5Error),
    #[error("upstream reported overload")]
    UpstreamOverloaded,
    #[error("upstream protocol error: {0}")]
    UpstreamProtocolError(String),
    #[error("client disconnected")]
    ClientDisconnect,
    #[error("TLS handshake failure: {0}")]
    TlsHandshakeFailure(String),
}
