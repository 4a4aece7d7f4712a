use fanout_config::ProxyEntry;

/// Immutable per-entry description of an upstream SOCKS5 proxy.
/// Identity is the `"host:port"` fingerprint returned by
/// [`ProxyDescriptor::key`], unique within the configured set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProxyDescriptor {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyDescriptor {
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl From<&ProxyEntry> for ProxyDescriptor {
    fn from(entry: &ProxyEntry) -> Self {
        Self {
            host: entry.host.clone(),
            port: entry.port,
            username: entry.username.clone(),
            password: entry.password.clone(),
        }
    }
}

impl From<ProxyEntry> for ProxyDescriptor {
    fn from(entry: ProxyEntry) -> Self {
        Self {
            host: entry.host,
            port: entry.port,
            username: entry.username,
            password: entry.password,
        }
    }
}
