use std::sync::Arc;

use tokio::sync::OwnedMutexGuard;

use super::connection::Connection;
use super::{ChannelIo, ConnEvent};
use crate::origin::HttpVersion;

/// One logical exchange over a connection. For HTTP/1.x this is the
/// connection's sole (or pipelined) in-flight request; for HTTP/2 it is one
/// of many concurrent streams, identified by an odd stream id.
///
/// The codec layer calls [`finish`](Stream::finish) when the exchange ends,
/// saying whether the connection may be reused. Dropping the stream without
/// finishing counts as `reuse = false`.
pub struct Stream {
    conn: Arc<Connection>,
    id: u32,
    finished: bool,
}

impl Stream {
    pub(crate) fn new(conn: Arc<Connection>, id: u32) -> Self {
        Self {
            conn,
            id,
            finished: false,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// HTTP/2 stream id; 0 for HTTP/1.x.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn version(&self) -> HttpVersion {
        self.conn.version()
    }

    /// Exclusive custody of the channel bytes for this exchange.
    pub async fn claim_io(&self) -> OwnedMutexGuard<ChannelIo> {
        self.conn.claim_io().await
    }

    /// End the exchange. `reuse` asks the pool to keep the connection; it is
    /// honored only while the connection is still valid.
    pub fn finish(mut self, reuse: bool) {
        self.complete(reuse);
    }

    fn complete(&mut self, reuse: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.conn.end_stream();
        if reuse && self.conn.is_valid() {
            self.conn.emit(ConnEvent::Reuse);
        } else {
            self.conn.emit(ConnEvent::Discard);
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.complete(false);
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("connection", &self.conn.id())
            .field("id", &self.id)
            .field("version", &self.version())
            .finish()
    }
}
