use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use super::channel::Channel;
use super::probe::Traffic;
use super::{ChannelIo, ConnEvent};
use crate::config::SHUTDOWN_TIMEOUT;
use crate::error::StreamError;
use crate::origin::HttpVersion;

/// A live, bound connection. The version is fixed at creation; validity and
/// closed-ness only ever flip one way. All IO callbacks for the connection
/// run on its owning runtime handle.
pub struct Connection {
    id: u64,
    version: HttpVersion,
    context: Handle,
    valid: AtomicBool,
    closed: AtomicBool,
    use_count: AtomicU64,
    active_streams: AtomicUsize,
    concurrency: AtomicUsize,
    next_stream_id: AtomicU32,
    compression: bool,
    io: Arc<Mutex<ChannelIo>>,
    events: UnboundedSender<ConnEvent>,
    idle_watch: StdMutex<Option<JoinHandle<()>>>,
    traffic: Option<Traffic>,
    fingerprint: Option<String>,
}

impl Connection {
    /// Bind a channel into a connection. `first_stream_id` is 3 for a
    /// connection produced by a cleartext upgrade (the upgrade request
    /// consumed stream 1), 1 otherwise; ignored for HTTP/1.x.
    pub(crate) fn bind(
        channel: Channel,
        version: HttpVersion,
        context: Handle,
        concurrency: usize,
        first_stream_id: u32,
        compression: bool,
    ) -> (Arc<Self>, UnboundedReceiver<ConnEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            id: channel.id,
            version,
            context,
            valid: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            use_count: AtomicU64::new(0),
            active_streams: AtomicUsize::new(0),
            concurrency: AtomicUsize::new(concurrency.max(1)),
            next_stream_id: AtomicU32::new(first_stream_id | 1),
            compression,
            io: Arc::new(Mutex::new(channel.io)),
            events: tx,
            idle_watch: StdMutex::new(None),
            traffic: channel.traffic,
            fingerprint: channel.fingerprint,
        });
        (conn, rx)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn version(&self) -> HttpVersion {
        self.version
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::SeqCst)
    }

    /// Monotonic: a connection never becomes valid again.
    pub fn invalidate(&self) {
        self.valid.store(false, Ordering::SeqCst);
    }

    /// Streams created over the connection's lifetime.
    pub fn use_count(&self) -> u64 {
        self.use_count.load(Ordering::SeqCst)
    }

    pub fn active_streams(&self) -> usize {
        self.active_streams.load(Ordering::SeqCst)
    }

    /// Whether the codec layer should install a response decompressor.
    pub fn compression_enabled(&self) -> bool {
        self.compression
    }

    /// (bytes received, bytes sent) when the activity probe is installed.
    pub fn traffic(&self) -> Option<(u64, u64)> {
        self.traffic.as_ref().map(|t| t.snapshot())
    }

    /// Peer certificate fingerprint, for TLS channels.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    pub(crate) fn context(&self) -> &Handle {
        &self.context
    }

    pub(crate) fn concurrency(&self) -> usize {
        self.concurrency.load(Ordering::SeqCst)
    }

    /// Adopt the peer-advertised concurrent-stream limit. Only meaningful
    /// when the local multiplexing limit is unbounded.
    pub(crate) fn set_concurrency(&self, limit: usize) {
        self.concurrency.store(limit.max(1), Ordering::SeqCst);
    }

    pub(crate) fn has_headroom(&self) -> bool {
        self.active_streams.load(Ordering::SeqCst) < self.concurrency()
    }

    /// Reserve a stream slot and allocate its id. Fails when the connection
    /// is invalid or the budget is saturated; the queue re-acquires then.
    pub(crate) fn begin_stream(&self) -> Result<u32, StreamError> {
        if !self.is_valid() {
            return Err(StreamError::Invalid);
        }
        let mut cur = self.active_streams.load(Ordering::SeqCst);
        loop {
            if cur >= self.concurrency() {
                return Err(StreamError::Saturated);
            }
            match self.active_streams.compare_exchange(
                cur,
                cur + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }
        let id = match self.version {
            HttpVersion::H2 => self.next_stream_id.fetch_add(2, Ordering::SeqCst),
            _ => 0,
        };
        Ok(id)
    }

    pub(crate) fn end_stream(&self) {
        self.active_streams.fetch_sub(1, Ordering::SeqCst);
    }

    /// Bump the use count, returning the previous value. Zero means this is
    /// the first stream ever created on the connection.
    pub(crate) fn mark_used(&self) -> u64 {
        self.use_count.fetch_add(1, Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: ConnEvent) {
        let _ = self.events.send(event);
    }

    /// Exactly-once guard for releasing the queue's conn_count slot.
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Exclusive custody of the channel bytes. HTTP/1.x codecs hold this for
    /// the whole exchange; the idle watcher holds it while the connection is
    /// parked.
    pub async fn claim_io(&self) -> OwnedMutexGuard<ChannelIo> {
        self.io.clone().lock_owned().await
    }

    /// Park the connection: watch for peer close or stray bytes, and for the
    /// idle deadline when one is configured. Any wake-up invalidates the
    /// connection and emits `Discard`.
    pub(crate) fn start_idle_watch(self: Arc<Self>, idle_timeout: Duration) {
        let mut slot = self.idle_watch.lock().unwrap();
        if slot.is_some() || !self.is_valid() {
            return;
        }
        let conn = self.clone();
        let handle = self.context.spawn(async move {
            let mut guard = conn.io.clone().lock_owned().await;
            let mut buf = [0u8; 1];
            let activity = async {
                let _ = guard.read(&mut buf).await;
            };
            if idle_timeout.is_zero() {
                activity.await;
            } else {
                tokio::select! {
                    _ = activity => {}
                    _ = tokio::time::sleep(idle_timeout) => {}
                }
            }
            conn.invalidate();
            conn.emit(ConnEvent::Discard);
        });
        *slot = Some(handle);
    }

    /// Must run before delivering the connection to a stream; the watcher
    /// releases io custody when aborted.
    pub(crate) fn stop_idle_watch(&self) {
        if let Some(handle) = self.idle_watch.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Invalidate and close the underlying channel.
    pub(crate) fn shutdown(self: Arc<Self>) {
        self.invalidate();
        self.stop_idle_watch();
        let conn = self.clone();
        self.context.spawn(async move {
            use tokio::io::AsyncWriteExt;
            if let Ok(mut guard) =
                tokio::time::timeout(SHUTDOWN_TIMEOUT(), conn.io.clone().lock_owned()).await
            {
                let _ = guard.shutdown().await;
            }
        });
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("valid", &self.is_valid())
            .field("use_count", &self.use_count())
            .field("active_streams", &self.active_streams())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(version: HttpVersion, concurrency: usize, first_id: u32) -> Arc<Connection> {
        let (client, _server) = tokio::io::duplex(64);
        let channel = Channel::new(7, Box::pin(client));
        let (conn, _rx) =
            Connection::bind(channel, version, Handle::current(), concurrency, first_id, false);
        conn
    }

    #[tokio::test]
    async fn h2_stream_ids_are_odd_and_increasing() {
        let conn = bound(HttpVersion::H2, 4, 1);
        assert_eq!(conn.begin_stream().unwrap(), 1);
        assert_eq!(conn.begin_stream().unwrap(), 3);
        assert_eq!(conn.begin_stream().unwrap(), 5);
    }

    #[tokio::test]
    async fn upgraded_connection_skips_stream_one() {
        let conn = bound(HttpVersion::H2, 4, 3);
        assert_eq!(conn.begin_stream().unwrap(), 3);
    }

    #[tokio::test]
    async fn budget_saturates_then_frees() {
        let conn = bound(HttpVersion::Http11, 1, 1);
        conn.begin_stream().unwrap();
        assert!(matches!(conn.begin_stream(), Err(StreamError::Saturated)));
        conn.end_stream();
        assert!(conn.begin_stream().is_ok());
    }

    #[tokio::test]
    async fn invalid_connection_refuses_streams() {
        let conn = bound(HttpVersion::Http11, 1, 1);
        conn.invalidate();
        assert!(matches!(conn.begin_stream(), Err(StreamError::Invalid)));
    }

    #[tokio::test]
    async fn close_accounting_is_exactly_once() {
        let conn = bound(HttpVersion::Http11, 1, 1);
        assert!(conn.mark_closed());
        assert!(!conn.mark_closed());
    }
}
