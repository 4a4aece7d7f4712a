use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::debug;

/// The tunnelled connection underneath a [`PooledClient`]: either a
/// plain SOCKS5-tunnelled TCP stream (destination port 80, and every
/// raw `CONNECT` tunnel) or the same tunnel with a TLS client session
/// layered on top (destination port 443 reached via the plain-HTTP
/// dispatcher, e.g. an embedded request inside a terminated `CONNECT`
/// session). Keeping both shapes behind one enum — rather than a
/// `Box<dyn AsyncRead + AsyncWrite>` — lets the dispatcher's relay code
/// stay oblivious to which leg it's writing to.
pub enum UpstreamStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl From<TcpStream> for UpstreamStream {
    fn from(stream: TcpStream) -> Self {
        UpstreamStream::Plain(stream)
    }
}

impl From<TlsStream<TcpStream>> for UpstreamStream {
    fn from(stream: TlsStream<TcpStream>) -> Self {
        UpstreamStream::Tls(Box::new(stream))
    }
}

impl AsyncRead for UpstreamStream {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for UpstreamStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_flush(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            UpstreamStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            UpstreamStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// A SOCKS5-tunnelled connection sitting idle in a [`SessionPool`],
/// still logically equivalent to a fresh connection.
pub struct PooledClient {
    pub stream: UpstreamStream,
    /// The `host:port` this tunnel was opened to. A checkout only
    /// reuses an entry whose destination matches, since a raw HTTP/1.1
    /// tunnel through one proxy to one origin cannot be silently
    /// redirected to a different origin.
    pub dest: String,
    pub last_used: Instant,
}

impl PooledClient {
    pub fn new(stream: impl Into<UpstreamStream>, dest: String) -> Self {
        Self {
            stream: stream.into(),
            dest,
            last_used: Instant::now(),
        }
    }
}

/// A bounded queue of reusable tunnelled connections for one upstream
/// proxy. Guarded by its own lock — never the Registry's selection
/// lock — and closing a client that doesn't fit happens by simply
/// dropping it once the guard is released.
pub struct SessionPool {
    max_size: usize,
    entries: Mutex<VecDeque<PooledClient>>,
}

impl SessionPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Remove and return a pooled client tunnelled to `dest`, if one
    /// exists. The caller owns it exclusively until it is returned via
    /// [`SessionPool::checkin`] or dropped.
    pub fn checkout(&self, dest: &str) -> Option<PooledClient> {
        let mut entries = self.entries.lock().unwrap();
        let pos = entries.iter().position(|c| c.dest == dest)?;
        entries.remove(pos)
    }

    /// Return a client to the pool. If the pool is already at capacity
    /// the client is dropped (closed) instead of grown past the bound.
    pub fn checkin(&self, mut client: PooledClient) {
        client.last_used = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.max_size {
            debug!(target: "fanout::registry", dest = %client.dest, "session pool full, closing connection");
            return;
        }
        entries.push_back(client);
    }

    /// Current number of idle pooled connections, for the stats
    /// snapshot's "session-pool depth" field.
    pub fn depth(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Drain and drop every pooled client. Called when a descriptor is
    /// removed by a config update.
    pub fn drain(&self) {
        self.entries.lock().unwrap().clear();
    }
}
