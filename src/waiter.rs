use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::conn::{Connection, Stream};
use crate::error::AcquireError;
use crate::metrics::WaiterToken;
use crate::origin::HttpVersion;

type ConnectionSink = Box<dyn FnOnce(&Arc<Connection>) + Send>;
type StreamSink = Box<dyn FnOnce(Stream) + Send>;
type FailureSink = Box<dyn FnOnce(AcquireError) + Send>;

/// A request for a connection-plus-stream. Carries the caller's runtime
/// handle (the manager supplies a default when absent), the requested
/// protocol, a monotonic cancellation flag and the three result sinks.
///
/// Exactly one of `on_stream` / `on_failure` fires, at most once, enforced
/// by an atomic completion flag. `on_connection` fires before `on_stream`
/// when the waiter's stream is the first ever created on its connection.
pub struct Waiter {
    context: Option<Handle>,
    version: HttpVersion,
    cancel: CancellationToken,
    completed: AtomicBool,
    queued: Mutex<Option<WaiterToken>>,
    on_connection: Mutex<Option<ConnectionSink>>,
    on_stream: Mutex<Option<StreamSink>>,
    on_failure: Mutex<Option<FailureSink>>,
}

impl Waiter {
    pub fn new(
        version: HttpVersion,
        on_stream: impl FnOnce(Stream) + Send + 'static,
        on_failure: impl FnOnce(AcquireError) + Send + 'static,
    ) -> Arc<Self> {
        Self::new_in(None, version, on_stream, on_failure)
    }

    /// Like [`new`](Waiter::new) but pins the waiter to a runtime handle;
    /// connections created for it are owned by that handle.
    pub fn new_in(
        context: Option<Handle>,
        version: HttpVersion,
        on_stream: impl FnOnce(Stream) + Send + 'static,
        on_failure: impl FnOnce(AcquireError) + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            version,
            cancel: CancellationToken::new(),
            completed: AtomicBool::new(false),
            queued: Mutex::new(None),
            on_connection: Mutex::new(None),
            on_stream: Mutex::new(Some(Box::new(on_stream))),
            on_failure: Mutex::new(Some(Box::new(on_failure))),
        })
    }

    /// Awaitable flavor: the receipt resolves to the stream or the terminal
    /// failure.
    pub fn channel(version: HttpVersion) -> (Arc<Self>, WaiterReceipt) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let tx2 = tx.clone();
        let waiter = Self::new(
            version,
            move |stream| {
                if let Some(tx) = tx.lock().unwrap().take() {
                    let _ = tx.send(Ok(stream));
                }
            },
            move |err| {
                if let Some(tx) = tx2.lock().unwrap().take() {
                    let _ = tx.send(Err(err));
                }
            },
        );
        (waiter, WaiterReceipt { rx })
    }

    /// Install the optional first-stream connection sink.
    pub fn on_connection(&self, sink: impl FnOnce(&Arc<Connection>) + Send + 'static) {
        *self.on_connection.lock().unwrap() = Some(Box::new(sink));
    }

    /// Cancellation is observed, not acted upon: the waiter is drained
    /// lazily and a connection handed out in a race is recycled intact.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn version(&self) -> HttpVersion {
        self.version
    }

    pub(crate) fn context(&self) -> Option<&Handle> {
        self.context.as_ref()
    }

    pub(crate) fn set_queued(&self, token: WaiterToken) {
        *self.queued.lock().unwrap() = Some(token);
    }

    pub(crate) fn take_queued(&self) -> Option<WaiterToken> {
        self.queued.lock().unwrap().take()
    }

    fn complete(&self) -> bool {
        self.completed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn succeed(&self, conn: &Arc<Connection>, first_use: bool, stream: Stream) {
        if !self.complete() {
            // Lost the race against a terminal failure; the dropped stream
            // releases its slot through the lifecycle channel.
            return;
        }
        if first_use {
            if let Some(sink) = self.on_connection.lock().unwrap().take() {
                sink(conn);
            }
        }
        self.on_failure.lock().unwrap().take();
        if let Some(sink) = self.on_stream.lock().unwrap().take() {
            sink(stream);
        }
    }

    pub(crate) fn fail(&self, err: AcquireError) {
        if !self.complete() {
            return;
        }
        self.on_stream.lock().unwrap().take();
        self.on_connection.lock().unwrap().take();
        if let Some(sink) = self.on_failure.lock().unwrap().take() {
            sink(err);
        }
    }
}

impl std::fmt::Debug for Waiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Waiter")
            .field("version", &self.version)
            .field("cancelled", &self.is_cancelled())
            .field("completed", &self.completed.load(Ordering::SeqCst))
            .finish()
    }
}

/// Awaitable side of [`Waiter::channel`].
pub struct WaiterReceipt {
    rx: oneshot::Receiver<Result<Stream, AcquireError>>,
}

impl WaiterReceipt {
    pub async fn stream(self) -> Result<Stream, AcquireError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(AcquireError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_waiter() -> (Arc<Waiter>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let ok = Arc::new(AtomicUsize::new(0));
        let err = Arc::new(AtomicUsize::new(0));
        let (ok2, err2) = (ok.clone(), err.clone());
        let waiter = Waiter::new(
            HttpVersion::Http11,
            move |_stream| {
                ok2.fetch_add(1, Ordering::SeqCst);
            },
            move |_err| {
                err2.fetch_add(1, Ordering::SeqCst);
            },
        );
        (waiter, ok, err)
    }

    #[test]
    fn failure_fires_exactly_once() {
        let (waiter, ok, err) = counting_waiter();
        waiter.fail(AcquireError::Closed);
        waiter.fail(AcquireError::Closed);
        assert_eq!(ok.load(Ordering::SeqCst), 0);
        assert_eq!(err.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancellation_is_monotonic() {
        let (waiter, _, _) = counting_waiter();
        assert!(!waiter.is_cancelled());
        waiter.cancel();
        waiter.cancel();
        assert!(waiter.is_cancelled());
    }

    #[tokio::test]
    async fn receipt_resolves_to_failure() {
        let (waiter, receipt) = Waiter::channel(HttpVersion::H2);
        waiter.fail(AcquireError::TooBusy(0));
        assert!(matches!(
            receipt.stream().await,
            Err(AcquireError::TooBusy(0))
        ));
    }
}
