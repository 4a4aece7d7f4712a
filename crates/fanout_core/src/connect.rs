//! `CONNECT` handling: TLS-terminating forwarding for port 443, raw
//! bidirectional tunneling for anything else.
//!
//! The TLS acceptor is an ALPN-pinned `rustls::ServerConfig` built once
//! from a cert/key pair at startup; the raw-tunnel branch is
//! `copy_bidirectional` wrapped in a single inactivity timeout.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fanout_http::request::{parse_connect_target, ConnectParseError};
use fanout_http::responses::{send_400, send_405, send_413, send_502, send_connection_established};
use fanout_registry::Registry;
use socks5_client::Socks5Auth;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::io::{read_head, MAX_BUFFERED_REQUEST_BODY};

const MAX_TUNNEL_ATTEMPTS: usize = 20;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const TUNNEL_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(60);
const TLS_TERMINATED_PORT: u16 = 443;

pub struct ConnectHandler {
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    tls_acceptor: Option<TlsAcceptor>,
    io_timeout: Duration,
}

impl ConnectHandler {
    pub fn new(
        registry: Arc<Registry>,
        dispatcher: Arc<Dispatcher>,
        tls_acceptor: Option<TlsAcceptor>,
        io_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            tls_acceptor,
            io_timeout,
        }
    }

    /// Handle one `CONNECT` request, having already consumed the request
    /// head (`raw_head`, without the trailing blank line) from `client`
    /// and leaving any pipelined bytes in `buf`.
    #[instrument(skip(self, client, buf, raw_head))]
    pub async fn handle<C: AsyncRead + AsyncWrite + Unpin>(
        &self,
        raw_head: &str,
        client: &mut C,
        buf: &mut BytesMut,
    ) -> anyhow::Result<()> {
        let (_, host, port) = match parse_connect_target(&format!("{raw_head}\r\n\r\n")) {
            Ok(parsed) => parsed,
            Err(ConnectParseError::MalformedRequestLine) => {
                send_400(client).await?;
                return Ok(());
            }
            Err(ConnectParseError::NotConnect) => {
                send_405(client).await?;
                return Ok(());
            }
            Err(ConnectParseError::MissingPort) => {
                send_400(client).await?;
                return Ok(());
            }
        };

        if port == TLS_TERMINATED_PORT && self.tls_acceptor.is_some() {
            self.handle_tls_terminated(&host, client, buf).await
        } else {
            self.handle_raw_tunnel(&host, port, client).await
        }
    }

    async fn handle_tls_terminated<C: AsyncRead + AsyncWrite + Unpin>(
        &self,
        host: &str,
        client: &mut C,
        buf: &mut BytesMut,
    ) -> anyhow::Result<()> {
        send_connection_established(client).await?;
        let prefix = std::mem::take(buf);
        let mut prefixed = crate::io::PrefixedStream::new(prefix, client);

        let acceptor = self.tls_acceptor.clone().expect("checked by caller");
        let handshake = timeout(self.io_timeout, accept_generic(acceptor, &mut prefixed)).await;
        let mut tls = match handshake {
            Ok(Ok(tls)) => tls,
            Ok(Err(e)) => {
                let err = crate::error::ProxyError::TlsHandshakeFailure(e.to_string());
                warn!(target: "fanout::connect", host, error = %err, "TLS handshake failed");
                return Ok(());
            }
            Err(_) => {
                let err = crate::error::ProxyError::TlsHandshakeFailure("handshake timed out".into());
                warn!(target: "fanout::connect", host, error = %err, "TLS handshake timed out");
                return Ok(());
            }
        };

        let mut last_status: Option<u16> = None;
        loop {
            let mut tls_buf = BytesMut::new();
            let Some(raw) = read_head(
                &mut tls,
                &mut tls_buf,
                self.io_timeout,
                self.io_timeout,
                64 * 1024,
            )
            .await?
            else {
                break;
            };

            let Some(embedded) = fanout_http::parse_head(&format!("{raw}\r\n\r\n")) else {
                break;
            };

            let Some(body) = read_embedded_body(&embedded, &mut tls, &mut tls_buf, self.io_timeout).await?
            else {
                send_413(&mut tls).await?;
                break;
            };

            self.dispatcher
                .forward(&embedded, &body, &mut tls, Some((host.to_string(), TLS_TERMINATED_PORT)))
                .await?;
            last_status = Some(200);

            if embedded
                .header("connection")
                .map(|v| v.eq_ignore_ascii_case("close"))
                .unwrap_or(false)
            {
                break;
            }
        }

        debug!(target: "fanout::connect", host, last_status = ?last_status, "TLS-terminated CONNECT session ended");
        Ok(())
    }

    async fn handle_raw_tunnel<C: AsyncRead + AsyncWrite + Unpin>(
        &self,
        host: &str,
        port: u16,
        client: &mut C,
    ) -> anyhow::Result<()> {
        let mut attempts = 0usize;
        let mut upstream: Option<TcpStream> = None;

        while attempts < MAX_TUNNEL_ATTEMPTS {
            let Some(handle) = self.registry.get_next() else {
                break;
            };
            attempts += 1;
            handle.stats.record_request();

            let auth = Socks5Auth {
                username: handle.descriptor.username.as_deref(),
                password: handle.descriptor.password.as_deref(),
            };
            match socks5_client::connect(
                &format!("{}:{}", handle.descriptor.host, handle.descriptor.port),
                auth,
                host,
                port,
                UPSTREAM_CONNECT_TIMEOUT,
            )
            .await
            {
                Ok(stream) => {
                    self.registry.mark_success(&handle.descriptor.key());
                    handle.stats.record_success();
                    upstream = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!(target: "fanout::connect", proxy = %handle.descriptor.key(), error = %e, "tunnel connect failed");
                    self.registry.mark_failure(&handle.descriptor.key());
                    handle.stats.record_failure();
                }
            }
        }

        let Some(mut upstream) = upstream else {
            send_502(client).await?;
            return Ok(());
        };

        send_connection_established(client).await?;

        match timeout(TUNNEL_INACTIVITY_TIMEOUT, copy_bidirectional(client, &mut upstream)).await {
            Ok(Ok((to_upstream, to_client))) => {
                info!(target: "fanout::connect", host, port, to_upstream, to_client, "tunnel closed");
            }
            Ok(Err(e)) => {
                debug!(target: "fanout::connect", host, port, error = %e, "tunnel relay error");
            }
            Err(_) => {
                debug!(target: "fanout::connect", host, port, "tunnel idle timeout");
            }
        }

        Ok(())
    }
}

async fn accept_generic<C: AsyncRead + AsyncWrite + Unpin>(
    acceptor: TlsAcceptor,
    stream: &mut C,
) -> std::io::Result<tokio_rustls::server::TlsStream<&mut C>> {
    acceptor.accept(stream).await
}

/// Returns `None` (writing nothing) if the embedded body would exceed
/// [`MAX_BUFFERED_REQUEST_BODY`]; the caller responds and ends the
/// session rather than trust an unbounded client-supplied length.
async fn read_embedded_body<R: AsyncRead + Unpin>(
    head: &fanout_http::request::RequestHead,
    reader: &mut R,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> anyhow::Result<Option<Vec<u8>>> {
    use bytes::Buf;

    if head.is_chunked() {
        // Embedded requests rarely carry chunked bodies in practice; if
        // one does, decode it into a single buffer so the dispatcher's
        // replay-on-retry buffering stays uniform.
        let mut collected = Vec::new();
        loop {
            let line = next_line(reader, buf, read_timeout).await?;
            let size_str = std::str::from_utf8(&line)
                .ok()
                .map(|s| s.trim())
                .unwrap_or("0");
            let size = usize::from_str_radix(size_str, 16).unwrap_or(0);
            if size == 0 {
                loop {
                    let trailer = next_line(reader, buf, read_timeout).await?;
                    if trailer.is_empty() {
                        return Ok(Some(collected));
                    }
                }
            }
            if collected.len() + size > MAX_BUFFERED_REQUEST_BODY {
                return Ok(None);
            }
            crate::io::fill_buffered(reader, buf, size + 2, read_timeout).await?;
            collected.extend_from_slice(&buf[..size]);
            buf.advance(size + 2);
        }
    }

    let len = head.content_length();
    if len == 0 {
        return Ok(Some(Vec::new()));
    }
    if len > MAX_BUFFERED_REQUEST_BODY {
        return Ok(None);
    }
    crate::io::fill_buffered(reader, buf, len, read_timeout).await?;
    let body = buf[..len].to_vec();
    buf.advance(len);
    Ok(Some(body))
}

async fn next_line<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    use bytes::Buf;
    loop {
        if let Some(end) = buf.windows(2).position(|w| w == b"\r\n") {
            let line = buf[..end].to_vec();
            buf.advance(end + 2);
            return Ok(line);
        }
        crate::io::read_more(reader, buf, read_timeout).await?;
    }
}

/// Build a TLS acceptor from a cert/key pair, loaded once at startup.
/// This proxy terminates exactly one logical identity for
/// `CONNECT`-tunneled traffic, so there is a single acceptor rather than
/// a map keyed by server name.
pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    use std::fs::File;
    use std::io::BufReader;

    let certs = {
        let file = File::open(cert_path)?;
        let mut reader = BufReader::new(file);
        let certs = rustls_pemfile::certs(&mut reader)?;
        if certs.is_empty() {
            anyhow::bail!("no certificates found in {cert_path}");
        }
        certs.into_iter().map(rustls::Certificate).collect::<Vec<_>>()
    };

    let key = {
        let file = File::open(key_path)?;
        let mut reader = BufReader::new(file);
        let keys = rustls_pemfile::pkcs8_private_keys(&mut reader)?;
        if let Some(key) = keys.into_iter().next() {
            rustls::PrivateKey(key)
        } else {
            let file = File::open(key_path)?;
            let mut reader = BufReader::new(file);
            let keys = rustls_pemfile::rsa_private_keys(&mut reader)?;
            keys.into_iter()
                .next()
                .map(rustls::PrivateKey)
                .ok_or_else(|| anyhow::anyhow!("no private keys found in {key_path}"))?
        }
    };

    let mut config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow::anyhow!("invalid TLS config: {e}"))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_target_parsing_is_delegated_and_functions() {
        let raw = "CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let (_, host, port) = parse_connect_target(raw).ok().unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 443);
    }
}
