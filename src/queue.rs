use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

use crate::config::Options;
use crate::conn::{Channel, ConnEvent, Connection};
use crate::connector::Connector;
use crate::error::AcquireError;
use crate::logger::Logger;
use crate::metrics::{EndpointToken, PoolMetrics, WaiterToken};
use crate::origin::{HttpVersion, OriginKey, UsageClass};
use crate::pool::Pool;
use crate::waiter::Waiter;
use crate::{log_debug, log_event, log_warn};

pub(crate) type QueueMap = DashMap<OriginKey, OriginQueue>;
pub(crate) type ConnMap = DashMap<u64, Arc<Connection>>;

/// Dependencies shared by every queue of one manager.
pub(crate) struct Core {
    pub options: Arc<Options>,
    pub logger: Logger,
    pub metrics: Arc<dyn PoolMetrics>,
    pub connector: Arc<Connector>,
    pub default_context: Handle,
}

/// Per-origin state machine: the active pool, the connection count
/// (including attempts mid-handshake) and the waiter FIFO. Every public
/// operation is a short critical section under one mutex; user-visible work
/// (sinks, IO) always happens outside it, on the connection's context.
///
/// The type is a cheap-clone handle; clones share one queue.
#[derive(Clone)]
pub(crate) struct OriginQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    key: OriginKey,
    usage: UsageClass,
    host_header: String,
    core: Arc<Core>,
    endpoint: EndpointToken,
    conn_map: Arc<ConnMap>,
    queues: Weak<QueueMap>,
    shutdown: CancellationToken,
    closed: AtomicBool,
    state: Mutex<QueueState>,
}

struct QueueState {
    pool: Pool,
    conn_count: usize,
    waiters: VecDeque<Arc<Waiter>>,
    /// Set when the queue removed itself from the registry; late acquires
    /// reroute through the registry to a fresh queue.
    dissolved: bool,
}

enum AcquireAction {
    Deliver(Arc<Connection>),
    Create,
    Queued,
    Busy,
    Reroute,
}

enum CloseAction {
    Create(Arc<Waiter>),
    Dissolve,
    Nothing,
}

impl OriginQueue {
    pub fn new(
        key: OriginKey,
        usage: UsageClass,
        version: HttpVersion,
        host_header: String,
        core: Arc<Core>,
        conn_map: Arc<ConnMap>,
        queues: Weak<QueueMap>,
    ) -> Self {
        let pool = Pool::for_version(version, &core.options);
        let endpoint = core
            .metrics
            .create_endpoint(&host_header, key.port, pool.capacity());
        log_debug!(core.logger, "queue: {} created for {}", key, version);
        Self {
            inner: Arc::new(QueueInner {
                key,
                usage,
                host_header,
                core,
                endpoint,
                conn_map,
                queues,
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
                state: Mutex::new(QueueState {
                    pool,
                    conn_count: 0,
                    waiters: VecDeque::new(),
                    dissolved: false,
                }),
            }),
        }
    }

    fn same_queue(&self, other: &OriginQueue) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn core(&self) -> &Core {
        &self.inner.core
    }

    pub fn conn_count(&self) -> usize {
        self.inner.state.lock().unwrap().conn_count
    }

    pub fn waiting(&self) -> usize {
        self.inner.state.lock().unwrap().waiters.len()
    }

    /// Hand the waiter an idle connection, start a new one, or queue it.
    /// Never blocks: all outcomes are scheduled work.
    pub fn acquire(&self, waiter: Arc<Waiter>) {
        if self.inner.closed.load(Ordering::SeqCst) {
            waiter.fail(AcquireError::Closed);
            return;
        }
        let options = &self.core().options;
        let action = {
            let mut st = self.inner.state.lock().unwrap();
            if st.dissolved {
                AcquireAction::Reroute
            } else if let Some(conn) = st.pool.poll() {
                AcquireAction::Deliver(conn)
            } else if st.pool.may_create(st.conn_count) {
                st.conn_count += 1;
                AcquireAction::Create
            } else if options.wait_queue_unbounded()
                || st.waiters.len() < options.max_wait_queue_size as usize
            {
                let token = self.core().metrics.enqueue_request(&self.inner.endpoint);
                waiter.set_queued(token);
                st.waiters.push_back(waiter.clone());
                AcquireAction::Queued
            } else {
                AcquireAction::Busy
            }
        };
        match action {
            AcquireAction::Deliver(conn) => {
                self.deliver(conn, waiter);
                self.drain_pending();
            }
            AcquireAction::Create => self.create_connection(waiter),
            AcquireAction::Queued => {}
            AcquireAction::Busy => {
                log_warn!(
                    self.core().logger,
                    "acquire: {} wait queue full ({})",
                    self.inner.key,
                    options.max_wait_queue_size
                );
                waiter.fail(AcquireError::TooBusy(options.max_wait_queue_size));
            }
            AcquireAction::Reroute => self.reroute(waiter),
        }
    }

    /// The queue dissolved between lookup and acquire; take the registry
    /// entry again (or the successor queue someone else installed).
    fn reroute(&self, waiter: Arc<Waiter>) {
        let Some(queues) = self.inner.queues.upgrade() else {
            waiter.fail(AcquireError::Closed);
            return;
        };
        let version = { self.inner.state.lock().unwrap().pool.version() };
        let queue = queues
            .entry(self.inner.key.clone())
            .or_insert_with(|| {
                OriginQueue::new(
                    self.inner.key.clone(),
                    self.inner.usage,
                    version,
                    self.inner.host_header.clone(),
                    self.inner.core.clone(),
                    self.inner.conn_map.clone(),
                    self.inner.queues.clone(),
                )
            })
            .value()
            .clone();
        queue.acquire(waiter);
    }

    /// A connection the pool considers reusable came back.
    pub fn recycle(&self, conn: &Arc<Connection>) {
        if !self.core().options.keep_alive || !conn.is_valid() {
            self.discard(conn);
            return;
        }
        {
            self.inner.state.lock().unwrap().pool.recycle(conn);
        }
        if conn.active_streams() == 0 {
            conn.clone()
                .start_idle_watch(self.core().options.idle_timeout);
        }
        self.drain_pending();
    }

    /// Remove the connection from the pool and close it. Connections with
    /// live streams are only invalidated; the last finishing stream emits
    /// the Discard that completes the teardown.
    pub fn discard(&self, conn: &Arc<Connection>) {
        {
            self.inner.state.lock().unwrap().pool.discard(conn.id());
        }
        self.inner.conn_map.remove(&conn.id());
        conn.invalidate();
        if conn.active_streams() > 0 {
            return;
        }
        conn.clone().shutdown();
        if conn.mark_closed() {
            self.connection_closed();
        }
    }

    /// Serve queued waiters while the pool has connections to offer,
    /// quietly dropping cancelled waiters at the head.
    pub fn drain_pending(&self) {
        loop {
            let mut dequeued: Vec<WaiterToken> = Vec::new();
            let next = {
                let mut st = self.inner.state.lock().unwrap();
                while st.waiters.front().is_some_and(|w| w.is_cancelled()) {
                    let cancelled = st.waiters.pop_front().unwrap();
                    if let Some(token) = cancelled.take_queued() {
                        dequeued.push(token);
                    }
                }
                if st.waiters.is_empty() {
                    None
                } else if let Some(conn) = st.pool.poll() {
                    let waiter = st.waiters.pop_front().unwrap();
                    if let Some(token) = waiter.take_queued() {
                        dequeued.push(token);
                    }
                    Some((conn, waiter))
                } else {
                    None
                }
            };
            for token in dequeued {
                self.core().metrics.dequeue_request(&self.inner.endpoint, token);
            }
            match next {
                Some((conn, waiter)) => self.deliver(conn, waiter),
                None => break,
            }
        }
    }

    /// Pop until a non-cancelled waiter, releasing metric tokens of the
    /// discarded ones. Caller holds the state lock.
    fn next_live_waiter(
        &self,
        st: &mut QueueState,
        dequeued: &mut Vec<WaiterToken>,
    ) -> Option<Arc<Waiter>> {
        while let Some(waiter) = st.waiters.pop_front() {
            if let Some(token) = waiter.take_queued() {
                dequeued.push(token);
            }
            if !waiter.is_cancelled() {
                return Some(waiter);
            }
        }
        None
    }

    /// A conn_count slot was released: a connection closed for good, or a
    /// creation attempt failed. Re-create for a parked waiter, or dissolve
    /// the queue when nothing is left.
    pub fn connection_closed(&self) {
        let mut dequeued: Vec<WaiterToken> = Vec::new();
        let action = {
            let mut st = self.inner.state.lock().unwrap();
            st.conn_count = st.conn_count.saturating_sub(1);
            if self.inner.closed.load(Ordering::SeqCst) {
                CloseAction::Nothing
            } else {
                match self.next_live_waiter(&mut st, &mut dequeued) {
                    Some(waiter) => {
                        // The pool may have shrunk on fallback; never exceed
                        // the active capacity.
                        if st.pool.may_create(st.conn_count) {
                            st.conn_count += 1;
                            CloseAction::Create(waiter)
                        } else {
                            let token =
                                self.core().metrics.enqueue_request(&self.inner.endpoint);
                            waiter.set_queued(token);
                            st.waiters.push_front(waiter);
                            CloseAction::Nothing
                        }
                    }
                    None => {
                        if st.conn_count == 0 && st.waiters.is_empty() {
                            st.dissolved = true;
                            CloseAction::Dissolve
                        } else {
                            CloseAction::Nothing
                        }
                    }
                }
            }
        };
        for token in dequeued {
            self.core().metrics.dequeue_request(&self.inner.endpoint, token);
        }
        match action {
            CloseAction::Create(waiter) => self.create_connection(waiter),
            CloseAction::Dissolve => {
                if let Some(queues) = self.inner.queues.upgrade() {
                    queues.remove_if(&self.inner.key, |_, q| q.same_queue(self));
                }
                self.core().metrics.close_endpoint(
                    &self.inner.host_header,
                    self.inner.key.port,
                    self.inner.endpoint,
                );
                log_event!(self.core().logger, "queue: {} dissolved", self.inner.key);
            }
            CloseAction::Nothing => {}
        }
    }

    /// Hand a polled connection to a waiter. Invalid connections restart
    /// the acquisition (their close arrives through the lifecycle path);
    /// cancelled waiters give the connection back intact. Callers outside
    /// the drain loop follow up with `drain_pending`.
    fn deliver(&self, conn: Arc<Connection>, waiter: Arc<Waiter>) {
        if !conn.is_valid() {
            self.acquire(waiter);
            return;
        }
        if waiter.is_cancelled() {
            self.recycle(&conn);
            return;
        }
        conn.stop_idle_watch();
        let queue = self.clone();
        let bound_conn = conn.clone();
        conn.context().spawn(async move {
            queue.deliver_bound(bound_conn, waiter);
        });
    }

    /// Runs on the connection's own context: create the stream and fire the
    /// waiter sinks. Saturation (an H2 race) restarts the acquisition.
    fn deliver_bound(&self, conn: Arc<Connection>, waiter: Arc<Waiter>) {
        if waiter.is_cancelled() {
            self.recycle(&conn);
            return;
        }
        let result = { self.inner.state.lock().unwrap().pool.create_stream(&conn) };
        match result {
            Err(_) => self.acquire(waiter),
            Ok(stream) => {
                let first_use = conn.mark_used() == 0;
                waiter.succeed(&conn, first_use, stream);
                // A pipelined or multiplexed connection with headroom left
                // goes straight back into rotation.
                let relisted = {
                    let mut st = self.inner.state.lock().unwrap();
                    if conn.is_valid() && conn.has_headroom() {
                        st.pool.recycle(&conn);
                        true
                    } else {
                        false
                    }
                };
                if relisted {
                    self.drain_pending();
                }
            }
        }
    }

    /// Start a connection attempt for the waiter. The conn_count slot is
    /// already reserved by the caller's critical section.
    fn create_connection(&self, waiter: Arc<Waiter>) {
        let context = waiter
            .context()
            .cloned()
            .unwrap_or_else(|| self.core().default_context.clone());

        if let Err(e) = self.core().connector.tls_helper().validate() {
            let queue = self.clone();
            context.spawn(async move {
                queue.connection_closed();
                waiter.fail(AcquireError::Handshake(e));
            });
            return;
        }

        let queue = self.clone();
        let key = self.inner.key.clone();
        let host = self.inner.host_header.clone();
        let version = { self.inner.state.lock().unwrap().pool.version() };
        context.spawn(async move {
            let connector = queue.core().connector.clone();
            tokio::select! {
                _ = queue.inner.shutdown.cancelled() => {
                    queue.connection_closed();
                    waiter.fail(AcquireError::Closed);
                }
                _ = connector.connect(&queue, &key, version, &host, key.port, waiter.clone()) => {}
            }
        });
    }

    // ---- negotiation events, reported by the connector ----

    /// TLS handshake done. ALPN `h2` keeps an H2 pool; anything else swaps
    /// to HTTP/1.x at the negotiated minor version.
    pub(crate) fn on_handshake_success_tls(
        &self,
        channel: Channel,
        negotiated: Option<&str>,
        waiter: Arc<Waiter>,
    ) {
        let Some(channel) = self.admit_channel(channel, &waiter) else {
            return;
        };
        let keep_h2 = negotiated == Some("h2") && {
            let st = self.inner.state.lock().unwrap();
            st.pool.is_h2()
        };
        if keep_h2 {
            self.bind_h2(channel, false, waiter);
            return;
        }
        let fallback = match negotiated {
            Some("http/1.0") => HttpVersion::Http10,
            _ => HttpVersion::Http11,
        };
        self.fallback_to_h1(fallback);
        self.bind_h1(channel, waiter);
        self.pump_creations();
    }

    /// Origin answered the upgrade request with a plain HTTP/1.1 response:
    /// transparent fallback, same channel.
    pub(crate) fn on_cleartext_upgrade_refused(&self, channel: Channel, waiter: Arc<Waiter>) {
        let Some(channel) = self.admit_channel(channel, &waiter) else {
            return;
        };
        self.fallback_to_h1(HttpVersion::Http11);
        self.bind_h1(channel, waiter);
        self.pump_creations();
    }

    /// H2 established: over TLS without ALPN, by prior knowledge, or by a
    /// successful cleartext upgrade (`upgraded` skips stream id 1).
    pub(crate) fn on_negotiated_h2(&self, channel: Channel, upgraded: bool, waiter: Arc<Waiter>) {
        let Some(channel) = self.admit_channel(channel, &waiter) else {
            return;
        };
        let is_h2 = { self.inner.state.lock().unwrap().pool.is_h2() };
        if is_h2 {
            self.bind_h2(channel, upgraded, waiter);
        } else {
            self.bind_h1(channel, waiter);
        }
    }

    /// HTTP/1.x established directly.
    pub(crate) fn on_negotiated_h1(&self, channel: Channel, waiter: Arc<Waiter>) {
        let Some(channel) = self.admit_channel(channel, &waiter) else {
            return;
        };
        self.bind_h1(channel, waiter);
    }

    /// Handshake failed; the channel (when still owned) is closed, the slot
    /// released, the waiter failed.
    pub(crate) fn on_handshake_failure(
        &self,
        channel: Option<Channel>,
        cause: anyhow::Error,
        waiter: Arc<Waiter>,
    ) {
        if let Some(channel) = channel {
            self.core().default_context.spawn(channel.close());
        }
        self.connection_closed();
        waiter.fail(AcquireError::Handshake(cause));
    }

    /// Dial failure: no channel ever existed.
    pub(crate) fn on_connect_failure(&self, waiter: Arc<Waiter>, cause: anyhow::Error) {
        self.connection_closed();
        if self.inner.closed.load(Ordering::SeqCst) {
            waiter.fail(AcquireError::Closed);
        } else {
            waiter.fail(AcquireError::Transport(cause));
        }
    }

    /// At most one pool swap per queue, H2 → H1 only; repeated fallback
    /// signals are no-ops.
    fn fallback_to_h1(&self, version: HttpVersion) {
        let mut st = self.inner.state.lock().unwrap();
        if st.pool.is_h2() {
            st.pool = Pool::for_version(version, &self.core().options);
            log_event!(
                self.core().logger,
                "queue: {} fell back to {}",
                self.inner.key,
                version
            );
        }
    }

    /// A fallback can grow the origin's capacity; start connections for
    /// waiters that were parked against the smaller pool.
    fn pump_creations(&self) {
        loop {
            let mut dequeued: Vec<WaiterToken> = Vec::new();
            let next = {
                let mut st = self.inner.state.lock().unwrap();
                if !st.pool.may_create(st.conn_count) {
                    None
                } else {
                    match self.next_live_waiter(&mut st, &mut dequeued) {
                        Some(waiter) => {
                            st.conn_count += 1;
                            Some(waiter)
                        }
                        None => None,
                    }
                }
            };
            for token in dequeued {
                self.core().metrics.dequeue_request(&self.inner.endpoint, token);
            }
            match next {
                Some(waiter) => self.create_connection(waiter),
                None => break,
            }
        }
    }

    /// A negotiated channel reaching a closed queue is shut down instead of
    /// bound; the slot is released and the waiter told about the shutdown.
    fn admit_channel(&self, channel: Channel, waiter: &Arc<Waiter>) -> Option<Channel> {
        if !self.inner.closed.load(Ordering::SeqCst) {
            return Some(channel);
        }
        self.core().default_context.spawn(channel.close());
        self.connection_closed();
        waiter.fail(AcquireError::Closed);
        None
    }

    fn bind_h1(&self, channel: Channel, waiter: Arc<Waiter>) {
        let context = Handle::current();
        let options = self.core().options.clone();
        let (conn, events) = {
            let mut st = self.inner.state.lock().unwrap();
            let version = st.pool.version();
            let (conn, events) = Connection::bind(
                channel,
                version,
                context,
                options.h1_concurrency(),
                1,
                options.try_use_compression,
            );
            st.pool.bind(conn.clone());
            (conn, events)
        };
        self.finish_bind(conn, events, waiter);
    }

    fn bind_h2(&self, channel: Channel, upgraded: bool, waiter: Arc<Waiter>) {
        let context = Handle::current();
        let options = self.core().options.clone();
        let first_stream_id = if upgraded { 3 } else { 1 };
        let (conn, events) = {
            let mut st = self.inner.state.lock().unwrap();
            let (conn, events) = Connection::bind(
                channel,
                HttpVersion::H2,
                context,
                options.h2_concurrency(),
                first_stream_id,
                options.try_use_compression,
            );
            st.pool.bind(conn.clone());
            (conn, events)
        };
        self.finish_bind(conn, events, waiter);
    }

    fn finish_bind(
        &self,
        conn: Arc<Connection>,
        events: UnboundedReceiver<ConnEvent>,
        waiter: Arc<Waiter>,
    ) {
        log_debug!(
            self.core().logger,
            "queue: {} bound connection {} ({})",
            self.inner.key,
            conn.id(),
            conn.version()
        );
        self.inner.conn_map.insert(conn.id(), conn.clone());
        self.install_lifecycle(conn.clone(), events);
        self.deliver(conn, waiter);
        self.drain_pending();
    }

    /// Route lifecycle messages: `reuse == true` recycles, anything else
    /// discards. The task ends once the connection is invalid and idle.
    fn install_lifecycle(&self, conn: Arc<Connection>, events: UnboundedReceiver<ConnEvent>) {
        let queue = self.clone();
        conn.context().clone().spawn(async move {
            let mut events = events;
            while let Some(event) = events.recv().await {
                match event {
                    ConnEvent::Reuse => queue.recycle(&conn),
                    ConnEvent::Discard => queue.discard(&conn),
                }
                if !conn.is_valid() && conn.active_streams() == 0 {
                    break;
                }
            }
        });
    }

    /// Fail queued waiters and close every connection. Called by the
    /// manager; the queue stays inert afterwards.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();
        let (waiters, conns) = {
            let mut st = self.inner.state.lock().unwrap();
            let waiters: Vec<_> = st.waiters.drain(..).collect();
            let conns = st.pool.close_all();
            (waiters, conns)
        };
        for waiter in waiters {
            if let Some(token) = waiter.take_queued() {
                self.core().metrics.dequeue_request(&self.inner.endpoint, token);
            }
            waiter.fail(AcquireError::Closed);
        }
        for conn in conns {
            self.inner.conn_map.remove(&conn.id());
            conn.clone().shutdown();
            // Wake the lifecycle task so it can run down and exit.
            conn.emit(ConnEvent::Discard);
        }
        self.core().metrics.close_endpoint(
            &self.inner.host_header,
            self.inner.key.port,
            self.inner.endpoint,
        );
        log_event!(
            self.core().logger,
            "queue: {} closed ({:?})",
            self.inner.key,
            self.inner.usage
        );
    }
}
