//! Plain HTTP forwarding: sanitizes a parsed request, replays it across
//! up to 20 distinct upstream SOCKS5 proxies until one answers, and
//! streams the origin's response back to the client without buffering
//! it whole. Retries on both transport failure and a `429` response,
//! trying a different `Available` proxy each time.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fanout_http::headers::{strip_request_headers, strip_response_headers};
use fanout_http::request::RequestHead;
use fanout_http::responses::{send_429, send_502, send_503, write_status_and_headers};
use fanout_registry::{PooledClient, ProxyHandle, Registry, UpstreamStream};
use socks5_client::Socks5Auth;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::TlsConnector;
use tracing::{debug, instrument, warn};

use crate::io::{read_head, relay_chunked, relay_exact};
use crate::upstream_tls;

const MAX_ATTEMPTS: usize = 20;
const UPSTREAM_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Threshold below which `429` exhaustion is reported to the client as
/// `429` itself (still might succeed shortly); at or above it, as `503`
/// (the fleet looks saturated rather than momentarily rate-limited).
const FEW_AVAILABLE_THRESHOLD: usize = 10;

pub struct Dispatcher {
    registry: Arc<Registry>,
    io_timeout: Duration,
    /// Built once: wraps the SOCKS5 tunnel in a TLS client session
    /// whenever the destination is port 443 (an embedded request
    /// inside a TLS-terminated `CONNECT` session targets the origin
    /// over HTTPS even though the bytes the dispatcher itself sees are
    /// already-decrypted plaintext HTTP). Upstream certificate
    /// validation is disabled; see `upstream_tls`.
    tls_connector: TlsConnector,
}

enum Outcome {
    /// Origin answered; the response (whatever its status) was relayed.
    Relayed,
    /// Origin reported `429`; caller should retry on a different proxy.
    Overloaded,
    /// Transport-level failure reaching/using the proxy; retry.
    TransportFailure,
    /// Origin answered fine, but the client went away (broken pipe/reset)
    /// while the response was being streamed back. Not the proxy's fault.
    ClientDisconnect,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, io_timeout: Duration) -> Self {
        Self {
            registry,
            io_timeout,
            tls_connector: upstream_tls::insecure_connector(),
        }
    }

    /// Forward one already-parsed request to its target origin, relaying
    /// the origin's response back over `client`. `body` is the full
    /// request body, already read off the client connection (buffered
    /// up front so it can be replayed identically across retries).
    /// `forced_dest` lets the `CONNECT` handler pin the destination to
    /// the host:port from the original `CONNECT` line rather than
    /// re-deriving it from the embedded request (which, inside a TLS
    /// tunnel targeting one origin, should always agree anyway — this
    /// just avoids trusting a client-controlled `Host` header for
    /// routing when the destination is already known).
    #[instrument(skip(self, client, head, body), fields(method = %head.method))]
    pub async fn forward<C: AsyncRead + AsyncWrite + Unpin>(
        &self,
        head: &RequestHead,
        body: &[u8],
        client: &mut C,
        forced_dest: Option<(String, u16)>,
    ) -> anyhow::Result<()> {
        let Some((dest_host, dest_port)) = forced_dest.or_else(|| target_host_port(head, 80)) else {
            warn!(target: "fanout::dispatch", "request carried no usable host");
            send_502(client).await?;
            return Ok(());
        };
        let dest = format!("{dest_host}:{dest_port}");
        let outbound_head = build_outbound_head(head, body);

        let mut last_outcome = Outcome::TransportFailure;
        let mut attempts = 0usize;
        let mut tried_keys = HashSet::new();

        while attempts < MAX_ATTEMPTS {
            let Some(handle) = self.registry.get_next() else {
                // Nothing left to try. If this is the very first attempt
                // there was never a proxy to begin with; otherwise every
                // candidate tried so far went to `Resting`/`Unavailable`
                // mid-loop, which the match below (keyed on the last
                // outcome seen) already knows how to report.
                break;
            };
            if !tried_keys.insert(handle.descriptor.key()) {
                // The selector cycled back to a proxy this request already
                // tried; every distinct candidate has had its shot.
                break;
            }
            attempts += 1;
            handle.stats.record_request();

            match self
                .try_once(&handle, &dest, &dest_host, dest_port, &outbound_head, body, client)
                .await
            {
                Ok(outcome) => {
                    last_outcome = outcome;
                    match last_outcome {
                        Outcome::Relayed => {
                            self.registry.mark_success(&handle.descriptor.key());
                            handle.stats.record_success();
                            return Ok(());
                        }
                        Outcome::ClientDisconnect => {
                            // The origin answered; only the client-facing
                            // write failed. Credit the proxy with a
                            // success and stop — there's no one left to
                            // write an error response to.
                            debug!(target: "fanout::dispatch", error = %crate::error::ProxyError::ClientDisconnect, "client gone mid-relay");
                            self.registry.mark_success(&handle.descriptor.key());
                            handle.stats.record_success();
                            return Ok(());
                        }
                        Outcome::Overloaded => {
                            debug!(target: "fanout::dispatch", proxy = %handle.descriptor.key(), error = %crate::error::ProxyError::UpstreamOverloaded, "proxy overloaded");
                            self.registry.mark_overloaded(&handle.descriptor.key());
                            handle.stats.record_overload();
                            handle.stats.record_failure();
                        }
                        Outcome::TransportFailure => {
                            self.registry.mark_failure(&handle.descriptor.key());
                            handle.stats.record_failure();
                        }
                    }
                }
                Err(e) => {
                    debug!(target: "fanout::dispatch", proxy = %handle.descriptor.key(), error = %e, "attempt failed");
                    self.registry.mark_failure(&handle.descriptor.key());
                    handle.stats.record_failure();
                    last_outcome = Outcome::TransportFailure;
                }
            }
        }

        if attempts == 0 {
            debug!(target: "fanout::dispatch", error = %crate::error::ProxyError::NoAvailableProxy, "no proxy available");
            send_503(client).await?;
            return Ok(());
        }

        match last_outcome {
            Outcome::Overloaded => {
                if self.registry.available_count() < FEW_AVAILABLE_THRESHOLD {
                    send_429(client).await?;
                } else {
                    send_503(client).await?;
                }
            }
            _ => send_502(client).await?,
        }
        Ok(())
    }

    async fn try_once<C: AsyncRead + AsyncWrite + Unpin>(
        &self,
        handle: &ProxyHandle,
        dest: &str,
        dest_host: &str,
        dest_port: u16,
        outbound_head: &str,
        body: &[u8],
        client: &mut C,
    ) -> anyhow::Result<Outcome> {
        let mut upstream = match handle.pool.checkout(dest) {
            Some(pooled) => pooled,
            None => {
                let auth = Socks5Auth {
                    username: handle.descriptor.username.as_deref(),
                    password: handle.descriptor.password.as_deref(),
                };
                let tunnel = socks5_client::connect(
                    &format!("{}:{}", handle.descriptor.host, handle.descriptor.port),
                    auth,
                    dest_host,
                    dest_port,
                    UPSTREAM_CONNECT_TIMEOUT,
                )
                .await
                .map_err(crate::error::ProxyError::UpstreamConnectFailure)?;

                let stream: UpstreamStream = if dest_port == 443 {
                    let server_name = ServerName::try_from(dest_host)
                        .map_err(|_| anyhow::anyhow!("invalid upstream server name '{dest_host}'"))?;
                    let tls = timeout(UPSTREAM_CONNECT_TIMEOUT, self.tls_connector.connect(server_name, tunnel))
                        .await
                        .map_err(|_| anyhow::anyhow!("upstream TLS handshake timed out"))??;
                    tls.into()
                } else {
                    tunnel.into()
                };
                PooledClient::new(stream, dest.to_string())
            }
        };

        let result = self
            .relay_once(outbound_head, body, &mut upstream.stream, client, &handle.stats)
            .await;
        match result {
            Ok(outcome) => {
                // `Overloaded` is safe to pool too: `relay_once` always
                // drains the 429 response body before returning it, so the
                // tunnel is left exactly where the next request expects it.
                if matches!(outcome, Outcome::Relayed | Outcome::Overloaded) {
                    handle.pool.checkin(upstream);
                }
                Ok(outcome)
            }
            Err(e) => Err(e),
        }
    }

    async fn relay_once<C: AsyncRead + AsyncWrite + Unpin>(
        &self,
        outbound_head: &str,
        body: &[u8],
        upstream: &mut UpstreamStream,
        client: &mut C,
        stats: &fanout_registry::ProxyStats,
    ) -> anyhow::Result<Outcome> {
        upstream.write_all(outbound_head.as_bytes()).await?;
        if !body.is_empty() {
            upstream.write_all(body).await?;
        }
        upstream.flush().await?;

        let mut upstream_buf = BytesMut::new();
        let Some(raw_head) = read_head(
            upstream,
            &mut upstream_buf,
            self.io_timeout,
            self.io_timeout,
            64 * 1024,
        )
        .await?
        else {
            return Ok(Outcome::TransportFailure);
        };

        let Some((status, reason, raw_headers)) = parse_status_line_and_headers(&raw_head) else {
            let err = crate::error::ProxyError::UpstreamProtocolError("malformed status line".into());
            debug!(target: "fanout::dispatch", error = %err, "treating as transport failure");
            return Ok(Outcome::TransportFailure);
        };
        stats.record_status(status);

        let headers = strip_response_headers(raw_headers);
        let content_length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, v)| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let is_chunked = headers
            .iter()
            .any(|(n, v)| n.eq_ignore_ascii_case("transfer-encoding") && v.to_ascii_lowercase().contains("chunked"));

        if status == 429 {
            // Drain whatever body the origin attached so the tunnel is
            // left at a clean message boundary and can be pooled instead
            // of closed.
            let mut sink = tokio::io::sink();
            if is_chunked {
                relay_chunked(upstream, &mut upstream_buf, &mut sink, self.io_timeout, 0).await?;
            } else if content_length > 0 {
                relay_exact(upstream, &mut upstream_buf, &mut sink, content_length, self.io_timeout).await?;
            }
            return Ok(Outcome::Overloaded);
        }

        // The origin has answered at this point; any failure from here on
        // is on the client-facing leg, not the upstream proxy's.
        let relayed: anyhow::Result<()> = async {
            write_status_and_headers(client, status, &reason, &headers).await?;
            if is_chunked {
                relay_chunked(upstream, &mut upstream_buf, client, self.io_timeout, 0).await?;
            } else if content_length > 0 {
                relay_exact(upstream, &mut upstream_buf, client, content_length, self.io_timeout).await?;
            }
            client.flush().await?;
            Ok(())
        }
        .await;

        match relayed {
            Ok(()) => Ok(Outcome::Relayed),
            Err(e) if is_client_disconnect(&e) => Ok(Outcome::ClientDisconnect),
            Err(e) => Err(e),
        }
    }
}

/// True if `err` wraps an I/O error characteristic of the client vanishing
/// mid-write (broken pipe, connection reset/aborted).
fn is_client_disconnect(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .map(|e| {
            matches!(
                e.kind(),
                std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
            )
        })
        .unwrap_or(false)
}

/// Parse a raw response head (`HTTP/x.y status reason\r\nHeader: v...`,
/// no trailing blank line) into its status code, reason phrase, and
/// header list. `None` on a malformed status line.
fn parse_status_line_and_headers(raw_head: &str) -> Option<(u16, String, Vec<(String, String)>)> {
    let mut lines = raw_head.split("\r\n");
    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status: u16 = parts.next()?.parse().ok()?;
    let reason = parts.next().unwrap_or("").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, reason, headers))
}

/// Builds the request head sent to the origin. `body` is the fully
/// decoded request body — chunked or not, `read_request_body`/
/// `read_embedded_body` always hand back one contiguous buffer, so a
/// `Transfer-Encoding: chunked` request from the client is re-framed here
/// as a plain `Content-Length` rather than forwarded with a chunked
/// header over an unchunked body.
fn build_outbound_head(head: &RequestHead, body: &[u8]) -> String {
    let path = origin_form_path(head);
    let mut headers = strip_request_headers(head.headers.clone());
    if head.is_chunked() {
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("transfer-encoding"));
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-length"));
        headers.push(("Content-Length".to_string(), body.len().to_string()));
    }
    let mut out = format!("{} {} HTTP/1.1\r\n", head.method, path);
    for (name, value) in &headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

fn origin_form_path(head: &RequestHead) -> String {
    if head.target.starts_with("http://") || head.target.starts_with("https://") {
        let without_scheme = head.target.splitn(2, "://").nth(1).unwrap_or("");
        match without_scheme.find('/') {
            Some(idx) => without_scheme[idx..].to_string(),
            None => "/".to_string(),
        }
    } else {
        head.target.clone()
    }
}

fn target_host_port(head: &RequestHead, default_port: u16) -> Option<(String, u16)> {
    let url = head.absolute_url()?;
    let without_scheme = url.splitn(2, "://").nth(1)?;
    let host_port = without_scheme.split('/').next().unwrap_or(without_scheme);
    match host_port.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            Some((host.to_string(), port.parse().ok()?))
        }
        _ => Some((host_port.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head(method: &str, target: &str, extra: &[(&str, &str)]) -> RequestHead {
        RequestHead {
            method: method.to_string(),
            target: target.to_string(),
            version: "HTTP/1.1".to_string(),
            headers: extra.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn origin_form_path_strips_absolute_uri_down_to_path() {
        let h = head("GET", "http://example.com/a/b?x=1", &[]);
        assert_eq!(origin_form_path(&h), "/a/b?x=1");
    }

    #[test]
    fn origin_form_path_passes_through_already_origin_form() {
        let h = head("GET", "/a/b", &[("Host", "example.com")]);
        assert_eq!(origin_form_path(&h), "/a/b");
    }

    #[test]
    fn target_host_port_reads_explicit_port() {
        let h = head("GET", "http://example.com:8080/x", &[]);
        assert_eq!(target_host_port(&h, 80), Some(("example.com".to_string(), 8080)));
    }

    #[test]
    fn target_host_port_defaults_port_when_absent() {
        let h = head("GET", "/x", &[("Host", "example.com")]);
        assert_eq!(target_host_port(&h, 80), Some(("example.com".to_string(), 80)));
    }

    #[test]
    fn build_outbound_head_strips_hop_by_hop_headers() {
        let h = head(
            "GET",
            "http://example.com/x",
            &[("Host", "example.com"), ("Proxy-Connection", "keep-alive")],
        );
        let out = build_outbound_head(&h, &[]);
        assert!(out.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(!out.to_ascii_lowercase().contains("proxy-connection"));
        assert!(out.contains("Host: example.com"));
    }

    #[test]
    fn build_outbound_head_reframes_chunked_request_as_content_length() {
        let h = head(
            "POST",
            "/upload",
            &[("Host", "example.com"), ("Transfer-Encoding", "chunked")],
        );
        let out = build_outbound_head(&h, b"hello");
        assert!(!out.to_ascii_lowercase().contains("transfer-encoding"));
        assert!(out.contains("Content-Length: 5"));
    }
}
