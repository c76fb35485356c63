use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::config::Options;
use crate::conn::Connection;
use crate::origin::HttpVersion;

/// HTTP/1.x strategy: an ordered free list over an outstanding set.
/// Pipelined pools serve the free list FIFO so in-flight depth spreads
/// across connections; plain keep-alive serves LIFO so hot connections
/// stay hot and the tail ages out.
pub(crate) struct H1Pool {
    version: HttpVersion,
    max: usize,
    fifo: bool,
    free: VecDeque<Arc<Connection>>,
    outstanding: HashMap<u64, Arc<Connection>>,
}

impl H1Pool {
    pub fn new(version: HttpVersion, options: &Options) -> Self {
        Self {
            version,
            max: options.max_pool_size.max(1),
            fifo: options.pipelining,
            free: VecDeque::new(),
            outstanding: HashMap::new(),
        }
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn bind(&mut self, conn: Arc<Connection>) {
        self.outstanding.insert(conn.id(), conn);
    }

    /// Closed connections can still be in the free list; delivery discovers
    /// invalidity and restarts acquisition, while the close path reconciles
    /// the slot count.
    pub fn poll(&mut self) -> Option<Arc<Connection>> {
        if self.fifo {
            self.free.pop_front()
        } else {
            self.free.pop_back()
        }
    }

    pub fn recycle(&mut self, conn: &Arc<Connection>) {
        if !self.outstanding.contains_key(&conn.id()) {
            return;
        }
        if self.free.iter().any(|c| c.id() == conn.id()) {
            return;
        }
        self.free.push_back(conn.clone());
    }

    pub fn discard(&mut self, conn_id: u64) {
        self.free.retain(|c| c.id() != conn_id);
        self.outstanding.remove(&conn_id);
    }

    pub fn close_all(&mut self) -> Vec<Arc<Connection>> {
        self.free.clear();
        self.outstanding.drain().map(|(_, c)| c).collect()
    }
}
