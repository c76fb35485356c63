use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AcquireError;

pub fn get_env_as_duration(name: &str, default: Duration) -> Duration {
    env::var(name)
        .ok()
        .and_then(|v| parse_go_duration(&v))
        .unwrap_or(default)
}

/// Parse Go-style duration strings like "5s", "100ms", "5m", "1h"
fn parse_go_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let mut total = Duration::ZERO;
    let mut remaining = s;

    while !remaining.is_empty() {
        let num_end = remaining
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(remaining.len());
        if num_end == 0 {
            return None;
        }
        let num: f64 = remaining[..num_end].parse().ok()?;
        remaining = &remaining[num_end..];

        let unit_end = remaining
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(remaining.len());
        let unit = &remaining[..unit_end];
        remaining = &remaining[unit_end..];

        total += match unit {
            "ns" => Duration::from_nanos(num as u64),
            "us" | "µs" => Duration::from_micros(num as u64),
            "ms" => Duration::from_millis(num as u64),
            "s" => Duration::from_secs_f64(num),
            "m" => Duration::from_secs_f64(num * 60.0),
            "h" => Duration::from_secs_f64(num * 3600.0),
            _ => return None,
        };
    }

    Some(total)
}

lazy_static_config! {
    pub DIAL_TIMEOUT: Duration = get_env_as_duration("WP_DIAL_TIMEOUT", Duration::from_secs(5));
    pub HANDSHAKE_TIMEOUT: Duration = get_env_as_duration("WP_HANDSHAKE_TIMEOUT", Duration::from_secs(5));
    pub UPGRADE_TIMEOUT: Duration = get_env_as_duration("WP_UPGRADE_TIMEOUT", Duration::from_secs(5));
    pub SHUTDOWN_TIMEOUT: Duration = get_env_as_duration("WP_SHUTDOWN_TIMEOUT", Duration::from_secs(5));
}

pub const DEFAULT_MAX_POOL_SIZE: usize = 5;
pub const DEFAULT_PIPELINING_LIMIT: usize = 10;
pub const DEFAULT_HTTP2_MAX_POOL_SIZE: usize = 1;
pub const DEFAULT_MAX_INITIAL_LINE_LENGTH: usize = 4096;
pub const DEFAULT_MAX_HEADER_SIZE: usize = 8192;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 8192;
pub const DEFAULT_DECODER_INITIAL_BUFFER_SIZE: usize = 128;

#[macro_export]
macro_rules! lazy_static_config {
    ($($vis:vis $name:ident : $ty:ty = $init:expr;)*) => {
        $(
            #[allow(non_snake_case, dead_code)]
            $vis fn $name() -> $ty {
                use std::sync::OnceLock;
                static VALUE: OnceLock<$ty> = OnceLock::new();
                *VALUE.get_or_init(|| $init)
            }
        )*
    };
}
pub(crate) use lazy_static_config;

/// Proxy flavor. A plaintext HTTP proxy is handled above this layer and
/// never reaches the proxied channel provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Http,
    Socks5,
}

#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
}

/// How the TLS helper decides whether to trust an origin.
#[derive(Debug, Clone, Default)]
pub enum TlsTrust {
    /// Verify against a PEM CA bundle on disk.
    CaFile(PathBuf),
    /// Skip certificate verification entirely.
    #[default]
    Insecure,
    /// Skip chain verification but require the peer certificate to match a
    /// `sha256:AA:BB:...` fingerprint.
    InsecurePinned(String),
}

/// HTTP/2 SETTINGS advertised in the `HTTP2-Settings` header during a
/// cleartext upgrade. Unset fields are omitted from the payload.
#[derive(Debug, Clone, Default)]
pub struct Http2Settings {
    pub header_table_size: Option<u32>,
    pub enable_push: Option<bool>,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: Option<u32>,
    pub max_frame_size: Option<u32>,
    pub max_header_list_size: Option<u32>,
}

/// Immutable configuration for a [`ConnectionManager`](crate::ConnectionManager).
#[derive(Debug, Clone)]
pub struct Options {
    /// Reuse connections after a response completes.
    pub keep_alive: bool,
    /// Allow several in-flight requests per HTTP/1.x connection.
    /// Only legal together with `keep_alive`.
    pub pipelining: bool,
    /// In-flight request cap per connection when pipelining.
    pub pipelining_limit: usize,
    /// HTTP/1.x connections per origin.
    pub max_pool_size: usize,
    /// Pending waiters per origin; negative means unbounded.
    pub max_wait_queue_size: i32,
    /// HTTP/2 connections per origin.
    pub http2_max_pool_size: usize,
    /// Concurrent streams per HTTP/2 connection; `< 1` means unbounded,
    /// i.e. the peer-advertised SETTINGS value governs.
    pub http2_multiplexing_limit: i32,
    /// HTTP/2 connection-level flow control window; 0 leaves the default.
    pub http2_connection_window_size: u32,
    /// Whether plaintext HTTP/2 goes through the h2c upgrade dance.
    pub http2_clear_text_upgrade: bool,
    /// Negotiate the protocol over TLS via ALPN.
    pub use_alpn: bool,
    /// Send SNI even when the peer host is an IP literal.
    pub force_sni: bool,
    /// Ask for compressed responses; the codec layer installs the inflater.
    pub try_use_compression: bool,
    /// Wrap channels in a byte-counting probe and log traffic at debug.
    pub log_activity: bool,
    /// Close connections idle longer than this; zero disables.
    pub idle_timeout: Duration,
    pub max_initial_line_length: usize,
    pub max_header_size: usize,
    pub max_chunk_size: usize,
    pub decoder_initial_buffer_size: usize,
    /// Route new channels through a proxy.
    pub proxy: Option<ProxyOptions>,
    /// SETTINGS advertised during the cleartext upgrade.
    pub initial_settings: Http2Settings,
    /// TCP dial timeout.
    pub connect_timeout: Duration,
    pub tls_trust: TlsTrust,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            keep_alive: true,
            pipelining: false,
            pipelining_limit: DEFAULT_PIPELINING_LIMIT,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            max_wait_queue_size: -1,
            http2_max_pool_size: DEFAULT_HTTP2_MAX_POOL_SIZE,
            http2_multiplexing_limit: -1,
            http2_connection_window_size: 0,
            http2_clear_text_upgrade: true,
            use_alpn: false,
            force_sni: false,
            try_use_compression: false,
            log_activity: false,
            idle_timeout: Duration::ZERO,
            max_initial_line_length: DEFAULT_MAX_INITIAL_LINE_LENGTH,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            decoder_initial_buffer_size: DEFAULT_DECODER_INITIAL_BUFFER_SIZE,
            proxy: None,
            initial_settings: Http2Settings::default(),
            connect_timeout: DIAL_TIMEOUT(),
            tls_trust: TlsTrust::default(),
        }
    }
}

impl Options {
    /// Option combinations that are only meaningful together.
    pub fn validate(&self) -> Result<(), AcquireError> {
        if self.pipelining && !self.keep_alive {
            return Err(AcquireError::Configuration(
                "pipelining requires keep-alive",
            ));
        }
        Ok(())
    }

    /// Effective per-connection stream cap for HTTP/1.x.
    pub(crate) fn h1_concurrency(&self) -> usize {
        if self.pipelining {
            self.pipelining_limit.max(1)
        } else {
            1
        }
    }

    /// Effective per-connection stream cap for HTTP/2, before the peer's
    /// SETTINGS are known. `< 1` clamps to unbounded.
    pub(crate) fn h2_concurrency(&self) -> usize {
        if self.http2_multiplexing_limit < 1 {
            usize::MAX
        } else {
            self.http2_multiplexing_limit as usize
        }
    }

    pub(crate) fn wait_queue_unbounded(&self) -> bool {
        self.max_wait_queue_size < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_go_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_go_duration("100ms"), Some(Duration::from_millis(100)));
        assert_eq!(
            parse_go_duration("1m30s"),
            Some(Duration::from_secs(90))
        );
        assert_eq!(parse_go_duration("x"), None);
        assert_eq!(parse_go_duration(""), None);
    }

    #[test]
    fn pipelining_needs_keep_alive() {
        let mut opts = Options::default();
        opts.pipelining = true;
        opts.keep_alive = false;
        assert!(opts.validate().is_err());
        opts.keep_alive = true;
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn multiplexing_limit_clamps_to_unbounded() {
        let mut opts = Options::default();
        assert_eq!(opts.h2_concurrency(), usize::MAX);
        opts.http2_multiplexing_limit = 0;
        assert_eq!(opts.h2_concurrency(), usize::MAX);
        opts.http2_multiplexing_limit = 8;
        assert_eq!(opts.h2_concurrency(), 8);
    }

    #[test]
    fn h1_concurrency_follows_pipelining() {
        let mut opts = Options::default();
        assert_eq!(opts.h1_concurrency(), 1);
        opts.pipelining = true;
        assert_eq!(opts.h1_concurrency(), DEFAULT_PIPELINING_LIMIT);
    }
}
