//! Hop-by-hop and proxy-trace header hygiene.
//!
//! This forward proxy never injects client-identifying headers — it
//! only strips, on both the request and response legs, so a client or
//! origin can't smuggle proxy-identifying information past the other
//! side.

/// Headers stripped from the request before it is forwarded to the
/// origin. Case-insensitive.
const REQUEST_STRIP_LIST: &[&str] = &[
    "proxy-connection",
    "proxy-authorization",
    "via",
    "x-forwarded-for",
    "x-forwarded-host",
    "x-real-ip",
    "x-proxy-authorization",
    "proxy-authenticate",
    "x-forwarded-server",
    "x-forwarded-port",
    "forwarded",
];

/// Headers stripped from the origin's response before it is relayed to
/// the client. Header names starting with `x-forwarded-` or `x-real-ip`
/// are also matched by prefix so an origin can't smuggle extra
/// forwarded-for variants past the filter.
const RESPONSE_STRIP_LIST: &[&str] = &[
    "connection",
    "transfer-encoding",
    "via",
    "x-real-ip",
    "proxy-connection",
    "proxy-authenticate",
    "server",
];

fn is_stripped(name: &str, list: &[&str]) -> bool {
    let lower = name.to_ascii_lowercase();
    if list.contains(&lower.as_str()) {
        return true;
    }
    lower.starts_with("x-forwarded-") || lower.starts_with("x-real-ip")
}

/// Remove every hop-by-hop / proxy-trace header from a request header
/// set, preserving the relative order of the headers that remain.
pub fn strip_request_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| !is_stripped(name, REQUEST_STRIP_LIST))
        .collect()
}

/// Remove every hop-by-hop header from an origin response before it is
/// relayed to the client.
pub fn strip_response_headers(headers: Vec<(String, String)>) -> Vec<(String, String)> {
    headers
        .into_iter()
        .filter(|(name, _)| !is_stripped(name, RESPONSE_STRIP_LIST))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_all_listed_request_headers() {
        let headers = vec![
            ("Host".to_string(), "example.com".to_string()),
            ("Proxy-Connection".to_string(), "keep-alive".to_string()),
            ("Proxy-Authorization".to_string(), "secret".to_string()),
            ("Via".to_string(), "1.1 foo".to_string()),
            ("X-Forwarded-For".to_string(), "1.2.3.4".to_string()),
            ("X-Forwarded-Host".to_string(), "a".to_string()),
            ("X-Real-IP".to_string(), "1.2.3.4".to_string()),
            ("Forwarded".to_string(), "for=1.2.3.4".to_string()),
        ];
        let kept = strip_request_headers(headers);
        assert_eq!(kept, vec![("Host".to_string(), "example.com".to_string())]);
    }

    #[test]
    fn strips_response_headers_and_keeps_the_rest() {
        let headers = vec![
            ("Content-Type".to_string(), "text/plain".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Server".to_string(), "nginx".to_string()),
        ];
        let kept = strip_response_headers(headers);
        assert_eq!(
            kept,
            vec![("Content-Type".to_string(), "text/plain".to_string())]
        );
    }

    #[test]
    fn is_case_insensitive() {
        let headers = vec![("VIA".to_string(), "1.1 foo".to_string())];
        assert!(strip_request_headers(headers).is_empty());
    }

    #[test]
    fn strips_x_real_ip_variants_by_prefix() {
        let headers = vec![
            ("X-Real-IP".to_string(), "1.2.3.4".to_string()),
            ("X-Real-IP-Extra".to_string(), "1.2.3.4".to_string()),
            ("Content-Type".to_string(), "text/plain".to_string()),
        ];
        let kept = strip_response_headers(headers);
        assert_eq!(kept, vec![("Content-Type".to_string(), "text/plain".to_string())]);
    }
}
