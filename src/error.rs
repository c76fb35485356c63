use thiserror::Error;

/// Terminal, per-waiter failures. Exactly one of these (or a stream) reaches
/// each admitted waiter.
#[derive(Debug, Error)]
pub enum AcquireError {
    /// Illegal option combination, surfaced synchronously at acquire time.
    #[error("illegal configuration: {0}")]
    Configuration(&'static str),

    /// The pool is saturated and the wait queue is full.
    #[error("connection pool reached max wait queue size of {0}")]
    TooBusy(i32),

    /// Dial failure or connection reset before a connection was bound.
    #[error("connect failed: {0}")]
    Transport(anyhow::Error),

    /// TLS handshake failure; the channel has been closed.
    #[error("failed to create TLS connection: {0}")]
    Handshake(anyhow::Error),

    /// The manager was closed while the waiter was queued or connecting.
    #[error("connection manager is closed")]
    Closed,
}

/// Why `create_stream` refused. Never surfaced to a waiter; the queue
/// re-enters acquisition instead.
#[derive(Debug, Error)]
pub(crate) enum StreamError {
    #[error("connection has no stream headroom")]
    Saturated,
    #[error("connection is no longer valid")]
    Invalid,
}
