use std::sync::Arc;

use crate::config::Options;
use crate::conn::Connection;

/// HTTP/2 strategy: at most `http2_max_pool_size` connections (typically
/// one), each multiplexing up to its concurrent-stream cap. The cap starts
/// at the configured multiplexing limit and adopts the peer-advertised
/// SETTINGS value when the limit is unbounded.
pub(crate) struct H2Pool {
    max: usize,
    conns: Vec<Arc<Connection>>,
}

impl H2Pool {
    pub fn new(options: &Options) -> Self {
        Self {
            max: options.http2_max_pool_size.max(1),
            conns: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.max
    }

    pub fn bind(&mut self, conn: Arc<Connection>) {
        self.conns.push(conn);
    }

    /// The connection stays shared; invalid ones are skipped so delivery
    /// cannot loop on a dead connection that is never removed by poll.
    pub fn poll(&mut self) -> Option<Arc<Connection>> {
        self.conns
            .iter()
            .find(|c| c.is_valid() && c.has_headroom())
            .cloned()
    }

    pub fn discard(&mut self, conn_id: u64) {
        self.conns.retain(|c| c.id() != conn_id);
    }

    pub fn close_all(&mut self) -> Vec<Arc<Connection>> {
        std::mem::take(&mut self.conns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Channel;
    use crate::origin::HttpVersion;
    use tokio::runtime::Handle;

    fn h2_conn(id: u64, concurrency: usize) -> Arc<Connection> {
        let (client, _server) = tokio::io::duplex(8);
        let channel = Channel::new(id, Box::pin(client));
        let (conn, _rx) = Connection::bind(
            channel,
            HttpVersion::H2,
            Handle::current(),
            concurrency,
            1,
            false,
        );
        conn
    }

    #[tokio::test]
    async fn single_connection_multiplexes_until_cap() {
        let mut pool = H2Pool::new(&Options::default());
        let conn = h2_conn(1, 2);
        pool.bind(conn.clone());

        assert_eq!(pool.poll().unwrap().id(), 1);
        conn.begin_stream().unwrap();
        assert_eq!(pool.poll().unwrap().id(), 1);
        conn.begin_stream().unwrap();
        // Saturated: both stream slots in use.
        assert!(pool.poll().is_none());
        conn.end_stream();
        assert_eq!(pool.poll().unwrap().id(), 1);
    }

    #[tokio::test]
    async fn invalid_connections_are_skipped() {
        let mut pool = H2Pool::new(&Options::default());
        let dead = h2_conn(1, 4);
        let live = h2_conn(2, 4);
        pool.bind(dead.clone());
        pool.bind(live);
        dead.invalidate();
        assert_eq!(pool.poll().unwrap().id(), 2);
    }

    #[tokio::test]
    async fn discard_removes_by_id() {
        let mut pool = H2Pool::new(&Options::default());
        pool.bind(h2_conn(1, 4));
        pool.discard(1);
        assert!(pool.poll().is_none());
        assert!(pool.close_all().is_empty());
    }

    #[tokio::test]
    async fn remote_settings_raise_the_cap() {
        let mut pool = H2Pool::new(&Options::default());
        let conn = h2_conn(1, usize::MAX);
        pool.bind(conn.clone());
        conn.set_concurrency(1);
        conn.begin_stream().unwrap();
        assert!(pool.poll().is_none());
        conn.set_concurrency(2);
        assert!(pool.poll().is_some());
    }
}
