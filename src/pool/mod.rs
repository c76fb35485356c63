pub(crate) mod h1;
pub(crate) mod h2;

use std::sync::Arc;

use crate::config::Options;
use crate::conn::{Connection, Stream};
use crate::error::StreamError;
use crate::origin::HttpVersion;

use h1::H1Pool;
use h2::H2Pool;

/// Version-specific pooling strategy. Lives behind the owning queue's lock;
/// fallback replaces the whole variant with a plain assignment, so
/// already-queued waiters see the new pool on their next step.
pub(crate) enum Pool {
    H1(H1Pool),
    H2(H2Pool),
}

impl Pool {
    pub fn for_version(version: HttpVersion, options: &Options) -> Self {
        match version {
            HttpVersion::H2 => Pool::H2(H2Pool::new(options)),
            v => Pool::H1(H1Pool::new(v, options)),
        }
    }

    pub fn version(&self) -> HttpVersion {
        match self {
            Pool::H1(p) => p.version(),
            Pool::H2(_) => HttpVersion::H2,
        }
    }

    pub fn is_h2(&self) -> bool {
        matches!(self, Pool::H2(_))
    }

    pub fn capacity(&self) -> usize {
        match self {
            Pool::H1(p) => p.capacity(),
            Pool::H2(p) => p.capacity(),
        }
    }

    /// `conn_count` includes connections still mid-handshake.
    pub fn may_create(&self, conn_count: usize) -> bool {
        conn_count < self.capacity()
    }

    /// Take an idle connection if the strategy has one to offer. H1 removes
    /// it from the free list; H2 leaves the connection shared.
    pub fn poll(&mut self) -> Option<Arc<Connection>> {
        match self {
            Pool::H1(p) => p.poll(),
            Pool::H2(p) => p.poll(),
        }
    }

    pub fn bind(&mut self, conn: Arc<Connection>) {
        match self {
            Pool::H1(p) => p.bind(conn),
            Pool::H2(p) => p.bind(conn),
        }
    }

    pub fn recycle(&mut self, conn: &Arc<Connection>) {
        match self {
            Pool::H1(p) => p.recycle(conn),
            // H2 never frees the whole connection on stream end.
            Pool::H2(_) => {}
        }
    }

    pub fn discard(&mut self, conn_id: u64) {
        match self {
            Pool::H1(p) => p.discard(conn_id),
            Pool::H2(p) => p.discard(conn_id),
        }
    }

    /// Reserve a stream slot on the connection. Saturation and invalidity
    /// are absorbed by re-acquisition, never surfaced to the waiter.
    pub fn create_stream(&mut self, conn: &Arc<Connection>) -> Result<Stream, StreamError> {
        let id = conn.begin_stream()?;
        Ok(Stream::new(conn.clone(), id))
    }

    pub fn close_all(&mut self) -> Vec<Arc<Connection>> {
        match self {
            Pool::H1(p) => p.close_all(),
            Pool::H2(p) => p.close_all(),
        }
    }
}
