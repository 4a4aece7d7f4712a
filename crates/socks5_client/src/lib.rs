//! Minimal RFC 1928 / RFC 1929 SOCKS5 client.
//!
//! Used to reach every upstream proxy in the pool: both for the plain
//! HTTP forward-proxy path (CONNECT-through-SOCKS to the origin) and for
//! raw `CONNECT` tunnels on non-443 ports.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument};

const VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USER_PASS: u8 = 0x02;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const AUTH_VERSION: u8 = 0x01;

/// Everything that can go wrong while talking to an upstream SOCKS5 proxy.
#[derive(Debug, thiserror::Error)]
pub enum Socks5Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connect timed out")]
    Timeout,
    #[error("proxy offered no acceptable authentication method")]
    NoAcceptableMethod,
    #[error("proxy sent an unexpected greeting reply")]
    GreetingMismatch,
    #[error("proxy rejected username/password authentication")]
    AuthRejected,
    #[error("destination hostname is too long for SOCKS5 (max 255 bytes)")]
    HostnameTooLong,
    #[error("general SOCKS server failure")]
    GeneralFailure,
    #[error("connection not allowed by ruleset")]
    ConnectionNotAllowed,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("host unreachable")]
    HostUnreachable,
    #[error("connection refused by destination")]
    ConnectionRefused,
    #[error("TTL expired")]
    TtlExpired,
    #[error("command not supported by proxy")]
    CommandNotSupported,
    #[error("address type not supported by proxy")]
    AddressTypeNotSupported,
    #[error("proxy reply carried an unknown reply code {0:#x}")]
    UnknownReply(u8),
}

impl Socks5Error {
    /// True for errors caused by the upstream proxy or destination being
    /// unreachable, as opposed to a local protocol violation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Socks5Error::Io(_)
                | Socks5Error::Timeout
                | Socks5Error::NetworkUnreachable
                | Socks5Error::HostUnreachable
                | Socks5Error::ConnectionRefused
                | Socks5Error::TtlExpired
                | Socks5Error::GeneralFailure
        )
    }

    fn from_rep(code: u8) -> Self {
        match code {
            0x01 => Socks5Error::GeneralFailure,
            0x02 => Socks5Error::ConnectionNotAllowed,
            0x03 => Socks5Error::NetworkUnreachable,
            0x04 => Socks5Error::HostUnreachable,
            0x05 => Socks5Error::ConnectionRefused,
            0x06 => Socks5Error::TtlExpired,
            0x07 => Socks5Error::CommandNotSupported,
            0x08 => Socks5Error::AddressTypeNotSupported,
            other => Socks5Error::UnknownReply(other),
        }
    }
}

/// Credentials and address for an upstream SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct Socks5Auth<'a> {
    pub username: Option<&'a str>,
    pub password: Option<&'a str>,
}

/// Open a TCP connection to `proxy_addr` and drive it through the SOCKS5
/// handshake to reach `dest_host:dest_port`, returning the tunnelled
/// stream. `connect_timeout` bounds the TCP connect plus the full
/// handshake; once the CONNECT reply is parsed the stream has no
/// read/write deadline of its own.
#[instrument(skip(auth), fields(proxy = %proxy_addr, dest_host, dest_port))]
pub async fn connect(
    proxy_addr: &str,
    auth: Socks5Auth<'_>,
    dest_host: &str,
    dest_port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, Socks5Error> {
    let mut stream = match timeout(connect_timeout, TcpStream::connect(proxy_addr)).await {
        Ok(res) => res?,
        Err(_) => return Err(Socks5Error::Timeout),
    };

    match timeout(
        connect_timeout,
        handshake(&mut stream, auth, dest_host, dest_port),
    )
    .await
    {
        Ok(res) => res?,
        Err(_) => return Err(Socks5Error::Timeout),
    }

    debug!(target: "socks5_client", proxy = %proxy_addr, dest_host, dest_port, "SOCKS5 tunnel established");
    Ok(stream)
}

async fn handshake(
    stream: &mut TcpStream,
    auth: Socks5Auth<'_>,
    dest_host: &str,
    dest_port: u16,
) -> Result<(), Socks5Error> {
    greet(stream, auth).await?;
    request_connect(stream, dest_host, dest_port).await
}

async fn greet(stream: &mut TcpStream, auth: Socks5Auth<'_>) -> Result<(), Socks5Error> {
    let want_auth = auth.username.is_some();
    let methods: &[u8] = if want_auth {
        &[METHOD_NO_AUTH, METHOD_USER_PASS]
    } else {
        &[METHOD_NO_AUTH]
    };

    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    stream.write_all(&greeting).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[0] != VERSION {
        return Err(Socks5Error::GreetingMismatch);
    }

    match reply[1] {
        METHOD_NO_AUTH => Ok(()),
        METHOD_USER_PASS if want_auth => authenticate(stream, auth).await,
        METHOD_NO_ACCEPTABLE => Err(Socks5Error::NoAcceptableMethod),
        _ => Err(Socks5Error::GreetingMismatch),
    }
}

async fn authenticate(stream: &mut TcpStream, auth: Socks5Auth<'_>) -> Result<(), Socks5Error> {
    let user = auth.username.unwrap_or("").as_bytes();
    let pass = auth.password.unwrap_or("").as_bytes();

    let mut req = Vec::with_capacity(3 + user.len() + pass.len());
    req.push(AUTH_VERSION);
    req.push(user.len() as u8);
    req.extend_from_slice(user);
    req.push(pass.len() as u8);
    req.extend_from_slice(pass);
    stream.write_all(&req).await?;

    let mut reply = [0u8; 2];
    stream.read_exact(&mut reply).await?;
    if reply[1] != 0x00 {
        return Err(Socks5Error::AuthRejected);
    }
    Ok(())
}

async fn request_connect(
    stream: &mut TcpStream,
    dest_host: &str,
    dest_port: u16,
) -> Result<(), Socks5Error> {
    let mut req = vec![VERSION, CMD_CONNECT, 0x00];
    encode_address(&mut req, dest_host)?;
    req.extend_from_slice(&dest_port.to_be_bytes());
    stream.write_all(&req).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(Socks5Error::GreetingMismatch);
    }
    if head[1] != 0x00 {
        return Err(Socks5Error::from_rep(head[1]));
    }

    match head[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4 + 2];
            stream.read_exact(&mut addr).await?;
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16 + 2];
            stream.read_exact(&mut addr).await?;
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut rest = vec![0u8; len[0] as usize + 2];
            stream.read_exact(&mut rest).await?;
        }
        _ => return Err(Socks5Error::AddressTypeNotSupported),
    }

    Ok(())
}

fn encode_address(buf: &mut Vec<u8>, host: &str) -> Result<(), Socks5Error> {
    if let Ok(v4) = host.parse::<Ipv4Addr>() {
        buf.push(ATYP_IPV4);
        buf.extend_from_slice(&v4.octets());
        return Ok(());
    }
    if let Ok(v6) = host.parse::<Ipv6Addr>() {
        buf.push(ATYP_IPV6);
        buf.extend_from_slice(&v6.octets());
        return Ok(());
    }
    if let Ok(IpAddr::V4(v4)) = host.parse::<IpAddr>() {
        buf.push(ATYP_IPV4);
        buf.extend_from_slice(&v4.octets());
        return Ok(());
    }

    let bytes = host.as_bytes();
    if bytes.len() > 255 {
        return Err(Socks5Error::HostnameTooLong);
    }
    buf.push(ATYP_DOMAIN);
    buf.push(bytes.len() as u8);
    buf.extend_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_ipv4_literal() {
        let mut buf = Vec::new();
        encode_address(&mut buf, "127.0.0.1").unwrap();
        assert_eq!(buf, vec![ATYP_IPV4, 127, 0, 0, 1]);
    }

    #[test]
    fn encodes_ipv6_literal() {
        let mut buf = Vec::new();
        encode_address(&mut buf, "::1").unwrap();
        assert_eq!(buf[0], ATYP_IPV6);
        assert_eq!(buf.len(), 1 + 16);
    }

    #[test]
    fn encodes_domain_name() {
        let mut buf = Vec::new();
        encode_address(&mut buf, "example.com").unwrap();
        assert_eq!(buf[0], ATYP_DOMAIN);
        assert_eq!(buf[1] as usize, "example.com".len());
        assert_eq!(&buf[2..], b"example.com");
    }

    #[test]
    fn rejects_oversized_hostname() {
        let mut buf = Vec::new();
        let long_host = "a".repeat(256);
        let err = encode_address(&mut buf, &long_host).unwrap_err();
        assert!(matches!(err, Socks5Error::HostnameTooLong));
    }

    #[test]
    fn maps_reply_codes_to_distinct_errors() {
        assert!(matches!(
            Socks5Error::from_rep(0x05),
            Socks5Error::ConnectionRefused
        ));
        assert!(matches!(
            Socks5Error::from_rep(0x03),
            Socks5Error::NetworkUnreachable
        ));
        assert!(matches!(
            Socks5Error::from_rep(0x08),
            Socks5Error::AddressTypeNotSupported
        ));
        assert!(matches!(
            Socks5Error::from_rep(0x09),
            Socks5Error::UnknownReply(0x09)
        ));
    }

    #[test]
    fn transport_classification() {
        assert!(Socks5Error::ConnectionRefused.is_transport());
        assert!(Socks5Error::Timeout.is_transport());
        assert!(!Socks5Error::AuthRejected.is_transport());
        assert!(!Socks5Error::CommandNotSupported.is_transport());
    }
}
