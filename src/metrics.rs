use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque handle for a per-origin endpoint created by the metrics sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointToken(pub u64);

/// Opaque handle for one queued waiter, paired enqueue/dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaiterToken(pub u64);

/// Metrics collaborator. Implementations must be thread-safe; every call
/// may arrive from any task. Enqueue/dequeue calls are balanced: delivery,
/// cancellation drain and shutdown all dequeue.
pub trait PoolMetrics: Send + Sync {
    fn create_endpoint(&self, host: &str, port: u16, max_size: usize) -> EndpointToken;
    fn close_endpoint(&self, host: &str, port: u16, token: EndpointToken);
    fn enqueue_request(&self, endpoint: &EndpointToken) -> WaiterToken;
    fn dequeue_request(&self, endpoint: &EndpointToken, waiter: WaiterToken);
    fn close(&self);
}

/// Default sink that only hands out unique tokens.
pub struct NoopMetrics {
    next: AtomicU64,
}

impl NoopMetrics {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl Default for NoopMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolMetrics for NoopMetrics {
    fn create_endpoint(&self, _host: &str, _port: u16, _max_size: usize) -> EndpointToken {
        EndpointToken(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn close_endpoint(&self, _host: &str, _port: u16, _token: EndpointToken) {}

    fn enqueue_request(&self, _endpoint: &EndpointToken) -> WaiterToken {
        WaiterToken(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn dequeue_request(&self, _endpoint: &EndpointToken, _waiter: WaiterToken) {}

    fn close(&self) {}
}
