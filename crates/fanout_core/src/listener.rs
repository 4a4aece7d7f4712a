//! Listener / worker pool: accepts client TCP connections and
//! demultiplexes each one into the plain-HTTP dispatcher or the
//! `CONNECT` handler based on the request line's method.
//!
//! Binds one `server.host:server.port` listener with `SO_REUSEADDR` set
//! explicitly via `socket2`, then runs a `Semaphore`-bounded accept loop
//! (one `tokio::spawn` per connection, permit released on drop).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use fanout_http::request::parse_head;
use fanout_http::responses::{send_400, send_413};
use socket2::{Domain, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::connect::ConnectHandler;
use crate::dispatcher::Dispatcher;
use crate::io::{read_head, MAX_BUFFERED_REQUEST_BODY};

/// Target concurrent-worker ceiling.
pub const DEFAULT_MAX_CONNECTIONS: usize = 500;

pub struct Listener {
    dispatcher: Arc<Dispatcher>,
    connect_handler: Arc<ConnectHandler>,
    semaphore: Arc<Semaphore>,
    request_idle_timeout: Duration,
    stop_tx: watch::Sender<bool>,
}

impl Listener {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        connect_handler: Arc<ConnectHandler>,
        max_connections: usize,
        request_idle_timeout: Duration,
    ) -> Self {
        let (stop_tx, _stop_rx) = watch::channel(false);
        Self {
            dispatcher,
            connect_handler,
            semaphore: Arc::new(Semaphore::new(max_connections.max(1))),
            request_idle_timeout,
            stop_tx,
        }
    }

    /// Bind `listen_addr` with `SO_REUSEADDR` set.
    #[instrument(skip(self))]
    pub async fn bind(&self, listen_addr: &str) -> anyhow::Result<TcpListener> {
        info!(target: "fanout::listener", listen = %listen_addr, "binding listener");
        let addr: SocketAddr = listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server.host/server.port '{listen_addr}': {e}"))?;

        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None)?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(1024)?;

        let listener = TcpListener::from_std(socket.into())?;
        info!(target: "fanout::listener", listen = %listen_addr, "bind() successful");
        Ok(listener)
    }

    /// Run the accept loop until [`Listener::stop`] is called: acquire a
    /// permit, accept, spawn a handler task, repeat — racing against a
    /// `watch`-driven stop signal (the health checker uses the same
    /// shutdown pattern).
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let mut stop_rx = self.stop_tx.subscribe();
        loop {
            tokio::select! {
                accepted = accept_with_permit(&listener, &self.semaphore) => {
                    let (stream, addr, permit) = match accepted {
                        Ok(v) => v,
                        Err(e) => {
                            error!(target: "fanout::listener", error = %e, "accept failed");
                            continue;
                        }
                    };
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        if let Err(e) = worker.handle_connection(stream, addr).await {
                            debug!(target: "fanout::worker", client = %addr, error = %e, "connection handling failed");
                        }
                    });
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!(target: "fanout::listener", "accept loop stopped");
        Ok(())
    }

    /// Signal the accept loop to stop; `handle` is the task returned by
    /// spawning [`Listener::serve`]. Waits up to 5 s for it to finish.
    pub async fn stop(&self, handle: tokio::task::JoinHandle<anyhow::Result<()>>) {
        let _ = self.stop_tx.send(true);
        if timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!(target: "fanout::listener", "listener did not stop within 5s");
        }
    }

    #[instrument(skip(self, stream), fields(client = %addr))]
    async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
        let mut buf = BytesMut::new();
        let Some(raw_head) = read_head(
            &mut stream,
            &mut buf,
            self.request_idle_timeout,
            self.request_idle_timeout,
            64 * 1024,
        )
        .await?
        else {
            return Ok(());
        };

        let Some(head) = parse_head(&format!("{raw_head}\r\n\r\n")) else {
            send_400(&mut stream).await?;
            return Ok(());
        };

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.connect_handler.handle(&raw_head, &mut stream, &mut buf).await
        } else {
            let Some(body) = read_request_body(&head, &mut stream, &mut buf, self.request_idle_timeout).await?
            else {
                send_413(&mut stream).await?;
                return Ok(());
            };
            self.dispatcher.forward(&head, &body, &mut stream, None).await
        }
    }
}

async fn accept_with_permit(
    listener: &TcpListener,
    semaphore: &Arc<Semaphore>,
) -> anyhow::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let (stream, addr) = listener.accept().await?;
    let permit = Arc::clone(semaphore).acquire_owned().await?;
    debug!(
        target: "fanout::listener",
        client = %addr,
        available_permits = semaphore.available_permits(),
        "connection accepted"
    );
    Ok((stream, addr, permit))
}

/// Reads the full request body off the client connection so it can be
/// replayed identically across the dispatcher's retries. Handles both
/// `Content-Length` and `Transfer-Encoding: chunked` the same way
/// [`crate::connect`]'s embedded-request reader does, decoding chunked
/// framing into one contiguous buffer. Returns `None` (having written
/// nothing) if the body would exceed [`MAX_BUFFERED_REQUEST_BODY`]; the
/// caller is responsible for responding to the client.
async fn read_request_body(
    head: &fanout_http::request::RequestHead,
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> anyhow::Result<Option<Vec<u8>>> {
    use bytes::Buf;

    if head.is_chunked() {
        let mut collected = Vec::new();
        loop {
            let line = read_line(stream, buf, read_timeout).await?;
            let size_str = std::str::from_utf8(&line)
                .ok()
                .map(str::trim)
                .unwrap_or("0");
            let size = usize::from_str_radix(size_str, 16).unwrap_or(0);
            if size == 0 {
                loop {
                    let trailer = read_line(stream, buf, read_timeout).await?;
                    if trailer.is_empty() {
                        return Ok(Some(collected));
                    }
                }
            }
            if collected.len() + size > MAX_BUFFERED_REQUEST_BODY {
                return Ok(None);
            }
            crate::io::fill_buffered(stream, buf, size + 2, read_timeout).await?;
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
    crate::io::fill_buffered(stream, buf, len, read_timeout).await?;
    let body = buf[..len].to_vec();
    buf.advance(len);
    Ok(Some(body))
}

async fn read_line(
    stream: &mut TcpStream,
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
        crate::io::read_more(stream, buf, read_timeout).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bind_rejects_unparsable_listen_address() {
        let listener = Listener::new(
            Arc::new(Dispatcher::new(
                Arc::new(fanout_registry::Registry::new(vec![], "random", 3, 30.0, 20)),
                Duration::from_secs(5),
            )),
            Arc::new(ConnectHandler::new(
                Arc::new(fanout_registry::Registry::new(vec![], "random", 3, 30.0, 20)),
                Arc::new(Dispatcher::new(
                    Arc::new(fanout_registry::Registry::new(vec![], "random", 3, 30.0, 20)),
                    Duration::from_secs(5),
                )),
                None,
                Duration::from_secs(5),
            )),
            DEFAULT_MAX_CONNECTIONS,
            Duration::from_secs(5),
        );
        assert!(listener.bind("not-an-address").await.is_err());
    }
}
