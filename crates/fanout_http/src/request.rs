//! Request-line and header parsing for the client-facing side of the
//! proxy. Drives both the plain-HTTP dispatcher and the `CONNECT`
//! handler — its job is reconstructing the absolute target URL a
//! forward proxy needs, not matching a location.

/// A request line plus its headers, parsed but not yet stripped of
/// hop-by-hop headers (see [`headers::strip_request_headers`]).
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    /// The raw request-target as it appeared on the wire: either
    /// absolute-URI (`http://host/path`) or origin-form (`/path`).
    pub target: String,
    pub version: String,
    /// Headers in wire order, name exactly as sent (case preserved).
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Case-insensitive header lookup, returning the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// The absolute URL a forward proxy must target: if `target` is
    /// already absolute-URI, used unchanged; otherwise reconstructed
    /// from the `Host` header plus the origin-form path.
    pub fn absolute_url(&self) -> Option<String> {
        if self.target.starts_with("http://") || self.target.starts_with("https://") {
            return Some(self.target.clone());
        }
        let host = self.header("host")?;
        Some(format!("http://{host}{}", self.target))
    }

    pub fn content_length(&self) -> usize {
        self.header("content-length")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0)
    }

    pub fn is_chunked(&self) -> bool {
        self.header("transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false)
    }
}

/// Parse a request line (`METHOD target HTTP/x.y`) and the headers that
/// follow, up to the blank line. `raw` must contain the full head
/// (request line + headers + trailing `\r\n\r\n`); returns `None` on a
/// malformed request line, which callers turn into `400 Bad Request`.
pub fn parse_head(raw: &str) -> Option<RequestHead> {
    let mut lines = raw.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();
    let version = parts.next().unwrap_or("HTTP/1.1").to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Some(RequestHead {
        method,
        target,
        version,
        headers,
    })
}

/// Parse `CONNECT host:port` specifically: `400` on a malformed request
/// line, `405` if the method isn't `CONNECT`, `400` if the target has
/// no port.
pub enum ConnectParseError {
    MalformedRequestLine,
    NotConnect,
    MissingPort,
}

pub fn parse_connect_target(raw: &str) -> Result<(RequestHead, String, u16), ConnectParseError> {
    let head = parse_head(raw).ok_or(ConnectParseError::MalformedRequestLine)?;
    if !head.method.eq_ignore_ascii_case("CONNECT") {
        return Err(ConnectParseError::NotConnect);
    }
    let (host, port_str) = head
        .target
        .rsplit_once(':')
        .ok_or(ConnectParseError::MissingPort)?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| ConnectParseError::MissingPort)?;
    let host = host.to_string();
    Ok((head, host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_origin_form_request_with_host_header() {
        let raw = "GET /get?x=1 HTTP/1.1\r\nHost: httpbin.org\r\nAccept: */*\r\n\r\n";
        let head = parse_head(raw).unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, "/get?x=1");
        assert_eq!(head.absolute_url().unwrap(), "http://httpbin.org/get?x=1");
    }

    #[test]
    fn parses_absolute_uri_request() {
        let raw = "GET http://httpbin.org/get HTTP/1.1\r\nHost: httpbin.org\r\n\r\n";
        let head = parse_head(raw).unwrap();
        assert_eq!(head.absolute_url().unwrap(), "http://httpbin.org/get");
    }

    #[test]
    fn parses_connect_target() {
        let raw = "CONNECT httpbin.org:443 HTTP/1.1\r\nHost: httpbin.org:443\r\n\r\n";
        let (_, host, port) = parse_connect_target(raw).ok().unwrap();
        assert_eq!(host, "httpbin.org");
        assert_eq!(port, 443);
    }

    #[test]
    fn rejects_connect_target_missing_port() {
        let raw = "CONNECT httpbin.org HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_connect_target(raw),
            Err(ConnectParseError::MissingPort)
        ));
    }

    #[test]
    fn rejects_non_connect_method() {
        let raw = "GET httpbin.org:443 HTTP/1.1\r\n\r\n";
        assert!(matches!(
            parse_connect_target(raw),
            Err(ConnectParseError::NotConnect)
        ));
    }
}
