//! TLS client connector for the upstream leg of a forwarded request
//! whose destination is port 443 — used when the plain-HTTP dispatcher
//! forwards an embedded request that arrived inside a TLS-terminated
//! `CONNECT` session (`connect.rs::handle_tls_terminated`) and the
//! origin itself speaks HTTPS.
//!
//! Certificate validation is disabled by default: this proxy may be
//! chained through anonymizing SOCKS5 networks whose exit nodes present
//! certificates with no meaningful chain of trust back to a root the
//! proxy operator would recognize, so full chain validation is out of
//! scope for the upstream leg by design.

use std::sync::Arc;
use std::time::SystemTime;

use tokio_rustls::rustls::client::{ServerCertVerified, ServerCertVerifier};
use tokio_rustls::rustls::{Certificate, ClientConfig, Error as TlsError, ServerName};
use tokio_rustls::TlsConnector;

struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

/// Build a `TlsConnector` that accepts any certificate the origin
/// presents, ALPN-restricted to `http/1.1` to match the plaintext
/// HTTP/1.1 the dispatcher speaks once the handshake completes.
pub fn insecure_connector() -> TlsConnector {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    TlsConnector::from(Arc::new(config))
}
