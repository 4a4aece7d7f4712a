use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Generic HTML body for an error response. Never mentions "proxy" or
/// any upstream identity — error bodies must not disclose which
/// upstream a request failed through.
fn generic_body(phrase: &str) -> String {
    format!(
        "<html><head><title>{phrase}</title></head>\
         <body><center><h1>{phrase}</h1></center></body></html>\n"
    )
}

/// Write a bare `HTTP/1.1 {code} {phrase}` response with a generic body,
/// closing the connection afterwards. The only shape used for the error
/// statuses that reach the client (no proxy availability, and terminal
/// retry exhaustion): 429, 502, 503, 504.
pub async fn send_status<W: AsyncWrite + Unpin + ?Sized>(
    stream: &mut W,
    code: u16,
    phrase: &str,
) -> anyhow::Result<()> {
    let body = generic_body(phrase);
    let response = format!(
        "HTTP/1.1 {code} {phrase}\r\n\
         Server: socks-fanout\r\n\
         Content-Type: text/html; charset=utf-8\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// `429 Too Many Requests` — surfaced when retry exhaustion still shows
/// 429 and fewer than 10 proxies are currently available.
pub async fn send_429<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_status(stream, 429, "Too Many Requests").await
}

/// `502 Bad Gateway` — surfaced on terminal transport failure.
pub async fn send_502<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_status(stream, 502, "Bad Gateway").await
}

/// `503 Service Unavailable` — surfaced when `Registry::get_next` returns
/// nothing, or retry exhaustion still shows 429 with ≥10 proxies
/// available.
pub async fn send_503<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_status(stream, 503, "Service Unavailable").await
}

/// `504 Gateway Timeout`.
pub async fn send_504<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_status(stream, 504, "Gateway Timeout").await
}

/// `400 Bad Request` — malformed request line reaching the listener or
/// the CONNECT handler.
pub async fn send_400<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_status(stream, 400, "Bad Request").await
}

/// `405 Method Not Allowed` — a non-CONNECT method reaching the CONNECT
/// handler, or vice versa.
pub async fn send_405<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_status(stream, 405, "Method Not Allowed").await
}

/// `413 Payload Too Large` — a request body exceeds the buffered-body
/// ceiling before it can be replayed across proxy retries.
pub async fn send_413<W: AsyncWrite + Unpin + ?Sized>(stream: &mut W) -> anyhow::Result<()> {
    send_status(stream, 413, "Payload Too Large").await
}

/// `HTTP/1.1 200 Connection Established` — the CONNECT handshake
/// acknowledgement, with no body (RFC 7231 §4.3.6).
pub async fn send_connection_established<W: AsyncWrite + Unpin + ?Sized>(
    stream: &mut W,
) -> anyhow::Result<()> {
    stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    stream.flush().await?;
    Ok(())
}

/// Write a response status line followed by an already-filtered header
/// set, ready for the caller to stream the body after. Used by the
/// dispatcher to relay an origin response without buffering it whole:
/// status line first, then the filtered header set, then body chunks.
pub async fn write_status_and_headers<W: AsyncWrite + Unpin + ?Sized>(
    stream: &mut W,
    status_code: u16,
    reason: &str,
    headers: &[(String, String)],
) -> anyhow::Result<()> {
    let mut out = format!("HTTP/1.1 {status_code} {reason}\r\n");
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    stream.write_all(out.as_bytes()).await?;
    Ok(())
}
