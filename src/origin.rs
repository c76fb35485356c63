use std::fmt;

/// Protocol version of a connection, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    Http10,
    Http11,
    H2,
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpVersion::Http10 => "http/1.0",
            HttpVersion::Http11 => "http/1.1",
            HttpVersion::H2 => "h2",
        };
        f.write_str(s)
    }
}

/// The two independent connection populations. Upgrade-style traffic pins
/// HTTP/1.1 and never shares connections with request-level pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageClass {
    Request,
    Upgrade,
}

/// Identity of a remote origin. Two callers with equal keys share one queue.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginKey {
    pub tls: bool,
    pub port: u16,
    pub host: String,
}

impl OriginKey {
    pub fn new(tls: bool, port: u16, host: impl Into<String>) -> Self {
        Self {
            tls,
            port,
            host: host.into(),
        }
    }
}

impl fmt::Display for OriginKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "https" } else { "http" };
        write!(f, "{}://{}:{}", scheme, self.host, self.port)
    }
}
