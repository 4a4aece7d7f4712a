//! Buffered head-reading and body-relay primitives shared by the plain
//! HTTP dispatcher and the `CONNECT` handler's embedded TLS requests.
//! A forward proxy has to move bytes onward rather than consume them
//! locally, so every read here ends up written back out to a second
//! stream instead of being discarded.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::time::{timeout, Duration};

pub const RELAY_CHUNK_SIZE: usize = 8192;

/// Ceiling on a request body buffered whole in memory so it can be
/// replayed identically across the dispatcher's retries. Bodies streamed
/// straight through (response relaying, chunked-response passthrough)
/// aren't subject to this — only the client-to-origin leg, which has to
/// be held in full until a proxy answers.
pub const MAX_BUFFERED_REQUEST_BODY: usize = 16 * 1024 * 1024;

/// Wraps a stream so that bytes already read into `prefix` (e.g. past
/// the end of a `CONNECT` request line, read in the same syscall as the
/// start of a TLS `ClientHello`) are yielded before any further reads
/// reach the underlying stream. Without this, bytes buffered ahead of a
/// TLS handshake would be silently dropped instead of fed to the
/// handshake.
pub struct PrefixedStream<'a, S> {
    prefix: BytesMut,
    inner: &'a mut S,
}

impl<'a, S> PrefixedStream<'a, S> {
    pub fn new(prefix: BytesMut, inner: &'a mut S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<'_, S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.prefix.is_empty() {
            let take = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..take]);
            self.prefix.advance(take);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut *self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<'_, S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut *self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut *self.get_mut().inner).poll_shutdown(cx)
    }
}

pub enum ReadOutcome {
    Read(usize),
    Timeout,
}

pub async fn read_more<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut BytesMut,
    timeout_dur: Duration,
) -> anyhow::Result<ReadOutcome> {
    let mut tmp = [0u8; RELAY_CHUNK_SIZE];
    match timeout(timeout_dur, stream.read(&mut tmp)).await {
        Ok(res) => {
            let n = res?;
            if n > 0 {
                buf.extend_from_slice(&tmp[..n]);
            }
            Ok(ReadOutcome::Read(n))
        }
        Err(_) => Ok(ReadOutcome::Timeout),
    }
}

/// Ensure at least `needed` bytes are buffered in `buf`, reading more off
/// `reader` as it arrives. Bails on an idle timeout or a clean EOF before
/// `needed` bytes ever arrive — the same treatment [`relay_exact`] gives a
/// body that stops short of its declared length, so a client or origin
/// that disconnects mid-body doesn't spin its caller forever re-reading
/// `ReadOutcome::Read(0)`.
pub async fn fill_buffered<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    needed: usize,
    read_timeout: Duration,
) -> anyhow::Result<()> {
    while buf.len() < needed {
        match read_more(reader, buf, read_timeout).await? {
            ReadOutcome::Timeout => anyhow::bail!("timed out reading buffered body"),
            ReadOutcome::Read(0) => anyhow::bail!("peer closed mid-body"),
            ReadOutcome::Read(_) => {}
        }
    }
    Ok(())
}

fn find_headers_end(buf: &BytesMut) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Read until a blank line terminates the request/response head. Returns
/// the head as a `String` (without the trailing `\r\n\r\n`) and leaves any
/// bytes read past it in `buf`. `None` on a clean EOF before any bytes
/// arrived, or on an idle timeout with nothing buffered.
pub async fn read_head<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut BytesMut,
    idle_timeout: Duration,
    read_timeout: Duration,
    max_head_bytes: usize,
) -> anyhow::Result<Option<String>> {
    loop {
        if let Some(pos) = find_headers_end(buf) {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            buf.advance(pos + 4);
            return Ok(Some(head));
        }

        if max_head_bytes > 0 && buf.len() > max_head_bytes {
            anyhow::bail!("request head exceeded {max_head_bytes} bytes");
        }

        let timeout_dur = if buf.is_empty() { idle_timeout } else { read_timeout };
        match read_more(stream, buf, timeout_dur).await? {
            ReadOutcome::Timeout => {
                if buf.is_empty() {
                    return Ok(None);
                }
                anyhow::bail!("timed out reading request head");
            }
            ReadOutcome::Read(0) => return Ok(None),
            ReadOutcome::Read(_) => {}
        }
    }
}

/// Relay exactly `remaining` bytes of a known-length body from `reader`
/// (consuming any already-buffered prefix in `buf` first) to `writer`, in
/// chunks no larger than [`RELAY_CHUNK_SIZE`].
pub async fn relay_exact<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    writer: &mut W,
    mut remaining: usize,
    read_timeout: Duration,
) -> anyhow::Result<()> {
    while remaining > 0 {
        if !buf.is_empty() {
            let take = remaining.min(buf.len());
            writer.write_all(&buf[..take]).await?;
            buf.advance(take);
            remaining -= take;
            continue;
        }
        match read_more(reader, buf, read_timeout).await? {
            ReadOutcome::Timeout => anyhow::bail!("timed out relaying request/response body"),
            ReadOutcome::Read(0) => anyhow::bail!("peer closed mid-body"),
            ReadOutcome::Read(_) => {}
        }
    }
    writer.flush().await?;
    Ok(())
}

fn find_crlf(buf: &BytesMut, start: usize) -> Option<usize> {
    buf[start..].windows(2).position(|w| w == b"\r\n").map(|i| start + i)
}

async fn read_line<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    read_timeout: Duration,
) -> anyhow::Result<Vec<u8>> {
    loop {
        if let Some(end) = find_crlf(buf, 0) {
            let line = buf.split_to(end + 2);
            return Ok(line.to_vec());
        }
        match read_more(reader, buf, read_timeout).await? {
            ReadOutcome::Timeout => anyhow::bail!("timed out reading chunk line"),
            ReadOutcome::Read(0) => anyhow::bail!("peer closed mid-chunk"),
            ReadOutcome::Read(_) => {}
        }
    }
}

/// Relay a `Transfer-Encoding: chunked` body verbatim — chunk-size lines,
/// chunk data, and the terminating `0\r\n\r\n` are forwarded byte for byte
/// rather than decoded and re-encoded, so the origin sees exactly what the
/// client sent (and vice versa for responses).
pub async fn relay_chunked<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    reader: &mut R,
    buf: &mut BytesMut,
    writer: &mut W,
    read_timeout: Duration,
    max_body: usize,
) -> anyhow::Result<()> {
    let mut body_bytes = 0usize;
    loop {
        let line = read_line(reader, buf, read_timeout).await?;
        writer.write_all(&line).await?;

        let size_str = std::str::from_utf8(&line[..line.len() - 2])
            .ok()
            .and_then(|s| s.split(';').next())
            .map(str::trim)
            .ok_or_else(|| anyhow::anyhow!("invalid chunk size line"))?;
        let chunk_size = usize::from_str_radix(size_str, 16)
            .map_err(|_| anyhow::anyhow!("invalid chunk size"))?;

        if chunk_size == 0 {
            loop {
                let trailer = read_line(reader, buf, read_timeout).await?;
                writer.write_all(&trailer).await?;
                if trailer == b"\r\n" {
                    writer.flush().await?;
                    return Ok(());
                }
            }
        }

        body_bytes = body_bytes.saturating_add(chunk_size);
        if max_body > 0 && body_bytes > max_body {
            anyhow::bail!("chunked body exceeded {max_body} bytes");
        }

        relay_exact(reader, buf, writer, chunk_size + 2, read_timeout).await?;
    }
}
