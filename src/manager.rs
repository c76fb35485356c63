use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::Handle;

use crate::config::Options;
use crate::conn::{ConnEvent, Connection};
use crate::connector::Connector;
use crate::error::AcquireError;
use crate::log_event;
use crate::logger::Logger;
use crate::metrics::{NoopMetrics, PoolMetrics};
use crate::origin::{HttpVersion, OriginKey, UsageClass};
use crate::queue::{ConnMap, Core, OriginQueue, QueueMap};
use crate::tls::TlsHelper;
use crate::waiter::Waiter;

/// One usage class worth of origin queues plus the shared
/// channel→connection map external codecs dispatch through.
pub(crate) struct Registry {
    usage: UsageClass,
    queues: Arc<QueueMap>,
    conn_map: Arc<ConnMap>,
}

impl Registry {
    fn new(usage: UsageClass) -> Self {
        Self {
            usage,
            queues: Arc::new(DashMap::new()),
            conn_map: Arc::new(DashMap::new()),
        }
    }

    fn get_or_create(
        &self,
        key: OriginKey,
        version: HttpVersion,
        host_header: String,
        core: &Arc<Core>,
    ) -> OriginQueue {
        self.queues
            .entry(key.clone())
            .or_insert_with(|| {
                OriginQueue::new(
                    key,
                    self.usage,
                    version,
                    host_header,
                    core.clone(),
                    self.conn_map.clone(),
                    Arc::downgrade(&self.queues),
                )
            })
            .value()
            .clone()
    }

    fn close(&self) {
        let queues: Vec<_> = self.queues.iter().map(|e| e.value().clone()).collect();
        self.queues.clear();
        for queue in queues {
            queue.close();
        }
        self.conn_map.clear();
    }
}

/// Top-level registry of origin queues, split by usage class: upgrade-style
/// traffic pins HTTP/1.1 and never shares connections with request pools
/// that may be HTTP/2.
pub struct ConnectionManager {
    core: Arc<Core>,
    request: Registry,
    upgrade: Registry,
    closed: AtomicBool,
}

impl ConnectionManager {
    /// Must be called from within a tokio runtime; the current handle
    /// becomes the default context for waiters that carry none.
    pub fn new(options: Options, logger: Logger) -> Self {
        Self::with_metrics(options, logger, Arc::new(NoopMetrics::new()))
    }

    pub fn with_metrics(
        options: Options,
        logger: Logger,
        metrics: Arc<dyn PoolMetrics>,
    ) -> Self {
        let options = Arc::new(options);
        let tls = Arc::new(TlsHelper::new(options.tls_trust.clone()));
        let connector = Arc::new(Connector::new(options.clone(), tls, logger.clone()));
        let core = Arc::new(Core {
            options,
            logger,
            metrics,
            connector,
            default_context: Handle::current(),
        });
        Self {
            core,
            request: Registry::new(UsageClass::Request),
            upgrade: Registry::new(UsageClass::Upgrade),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &Options {
        &self.core.options
    }

    /// Route a waiter to the request-side queue for `(tls, port, peer_host)`.
    /// On error the waiter's `on_failure` has already fired.
    pub fn acquire_for_request(
        &self,
        version: HttpVersion,
        peer_host: &str,
        tls: bool,
        port: u16,
        host: &str,
        waiter: &Arc<Waiter>,
    ) -> Result<(), AcquireError> {
        if self.closed.load(Ordering::SeqCst) {
            waiter.fail(AcquireError::Closed);
            return Err(AcquireError::Closed);
        }
        if let Err(AcquireError::Configuration(reason)) = self.core.options.validate() {
            waiter.fail(AcquireError::Configuration(reason));
            return Err(AcquireError::Configuration(reason));
        }
        let key = OriginKey::new(tls, port, peer_host);
        let queue = self
            .request
            .get_or_create(key, version, host.to_string(), &self.core);
        queue.acquire(waiter.clone());
        Ok(())
    }

    /// Route a waiter to the upgrade-side queue. Always HTTP/1.1.
    pub fn acquire_for_upgrade(
        &self,
        tls: bool,
        port: u16,
        host: &str,
        waiter: &Arc<Waiter>,
    ) -> Result<(), AcquireError> {
        if self.closed.load(Ordering::SeqCst) {
            waiter.fail(AcquireError::Closed);
            return Err(AcquireError::Closed);
        }
        let key = OriginKey::new(tls, port, host);
        let queue =
            self.upgrade
                .get_or_create(key, HttpVersion::Http11, host.to_string(), &self.core);
        queue.acquire(waiter.clone());
        Ok(())
    }

    /// Close every queue in both registries, then the metrics sink.
    /// Outstanding waiters fail with [`AcquireError::Closed`]; no channels
    /// stay open.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.request.close();
        self.upgrade.close();
        self.core.metrics.close();
        log_event!(self.core.logger, "manager: closed");
    }

    // ---- inbound-event dispatch for external codecs ----

    /// Look a connection up by channel id.
    pub fn connection_of(&self, channel_id: u64) -> Option<Arc<Connection>> {
        self.request
            .conn_map
            .get(&channel_id)
            .or_else(|| self.upgrade.conn_map.get(&channel_id))
            .map(|e| e.value().clone())
    }

    /// The peer advertised SETTINGS_MAX_CONCURRENT_STREAMS. Adopted only
    /// while the configured multiplexing limit is unbounded; parked waiters
    /// are re-drained against the new headroom.
    pub fn remote_settings(&self, channel_id: u64, max_concurrent_streams: u32) {
        if self.core.options.http2_multiplexing_limit >= 1 {
            return;
        }
        if let Some(conn) = self.connection_of(channel_id) {
            conn.set_concurrency(max_concurrent_streams as usize);
            conn.emit(ConnEvent::Reuse);
        }
    }

    /// The peer sent GOAWAY or reset the connection: invalidate it so
    /// outstanding streams observe the loss and new waiters re-dial.
    pub fn remote_goaway(&self, channel_id: u64) {
        if let Some(conn) = self.connection_of(channel_id) {
            conn.invalidate();
            conn.emit(ConnEvent::Discard);
        }
    }

    // ---- introspection ----

    /// Origins currently retained in a registry.
    pub fn active_origins(&self, usage: UsageClass) -> usize {
        self.registry(usage).queues.len()
    }

    /// Live-plus-pending connection count for one origin.
    pub fn connection_count(&self, usage: UsageClass, key: &OriginKey) -> usize {
        self.registry(usage)
            .queues
            .get(key)
            .map(|q| q.conn_count())
            .unwrap_or(0)
    }

    /// Waiters parked for one origin.
    pub fn waiting(&self, usage: UsageClass, key: &OriginKey) -> usize {
        self.registry(usage)
            .queues
            .get(key)
            .map(|q| q.waiting())
            .unwrap_or(0)
    }

    fn registry(&self, usage: UsageClass) -> &Registry {
        match usage {
            UsageClass::Request => &self.request,
            UsageClass::Upgrade => &self.upgrade,
        }
    }
}
