//! Client-side HTTP connection manager.
//!
//! Multiplexes many concurrent callers over a bounded set of physical
//! connections per origin, hides the protocol-version choice (HTTP/1.0,
//! HTTP/1.1, HTTP/2) and its negotiation (TLS-ALPN or cleartext h2c
//! upgrade), and keeps two independent connection populations: one for
//! request-response traffic, one for long-lived upgrade-style usage.
//!
//! Callers submit a [`Waiter`] to the [`ConnectionManager`] for an origin.
//! The per-origin queue hands back an idle connection, dials a new one, or
//! parks the waiter in a bounded FIFO. Protocol negotiation can replace an
//! origin's HTTP/2 pool with an HTTP/1.x pool once (fallback); waiters in
//! the queue use the new pool transparently.
//!
//! HTTP framing, TLS internals and proxy tunneling live outside this crate:
//! codecs receive a [`Stream`] plus exclusive channel custody and report
//! lifecycle events back through the manager.

mod config;
mod conn;
mod connector;
mod error;
mod logger;
mod manager;
mod metrics;
mod origin;
mod pool;
mod queue;
mod tls;
mod transport;
mod waiter;

pub use config::{Http2Settings, Options, ProxyKind, ProxyOptions, TlsTrust};
pub use conn::{Connection, Stream};
pub use error::AcquireError;
pub use logger::{LogLevel, Logger};
pub use manager::ConnectionManager;
pub use metrics::{EndpointToken, NoopMetrics, PoolMetrics, WaiterToken};
pub use origin::{HttpVersion, OriginKey, UsageClass};
pub use tls::{format_cert_fingerprint, TlsHelper};
pub use transport::{ChannelProvider, DirectProvider, ProxiedProvider};
pub use waiter::{Waiter, WaiterReceipt};
