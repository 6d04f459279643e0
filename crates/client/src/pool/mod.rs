//! Bounded pool of reusable connections per remote host
//!
//! The pool owns every connection it creates. Callers lease one with
//! [`ConnectionPool::acquire`] and hand it back with
//! [`ConnectionPool::release`] (or discard it with [`ConnectionPool::close`]).
//!
//! # Limits
//!
//! Connections being established count against both limits, so
//! `max_connections_per_host` and `max_connections` bound every connection
//! the pool is responsible for, not only the open ones.
//!
//! # Waiting
//!
//! When no connection can be reused or created, `acquire` parks in a FIFO
//! wait list. Every release, close or maintenance sweep rescans the list
//! synchronously and hands out connections in arrival order (reuse before
//! create). A waiter that times out is removed from the list.
//!
//! # Maintenance
//!
//! A background task started on construction closes idle connections that
//! went stale (idle too long, or older than the keep-alive lifetime). It
//! needs a Tokio runtime; without one the sweep is skipped and
//! [`ConnectionPool::run_maintenance`] can be driven manually.

mod config;
mod connection;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use synclink_common::error::CommonResult;
use synclink_common::time::{Clock, SystemClock};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub use self::config::PoolConfig;
use self::connection::ConnectionEntry;
pub use self::connection::{Connection, ConnectionInfo, ConnectionState};
use crate::error::{NetError, NetResult};
use crate::events::{EventBus, NetEvent};
use crate::transport::{Endpoint, OutboundRequest, RequestOptions, Response, Transport};

/// What a successful admission allows the caller to do
enum Grant {
    /// An idle connection, already marked active
    Reuse(Connection),
    /// A reserved slot for a new connection
    Create,
}

struct Waiter {
    id: u64,
    endpoint: Endpoint,
    tx: oneshot::Sender<NetResult<Grant>>,
}

enum Admission {
    Granted(Grant),
    Queued(u64, oneshot::Receiver<NetResult<Grant>>),
}

#[derive(Default)]
struct PoolState {
    connections: HashMap<String, ConnectionEntry>,
    /// Connections being established, per `host:port`
    establishing: HashMap<String, usize>,
    waiters: VecDeque<Waiter>,
}

impl PoolState {
    fn host_count(&self, host_key: &str) -> usize {
        let open =
            self.connections.values().filter(|c| c.endpoint.host_key() == host_key).count();
        open + self.establishing.get(host_key).copied().unwrap_or(0)
    }

    fn total_count(&self) -> usize {
        self.connections.len() + self.establishing.values().sum::<usize>()
    }

    fn has_waiter_for(&self, host_key: &str) -> bool {
        self.waiters.iter().any(|w| w.endpoint.host_key() == host_key)
    }

    fn reserve(&mut self, host_key: String) {
        *self.establishing.entry(host_key).or_insert(0) += 1;
    }

    fn unreserve(&mut self, host_key: &str) {
        if let Some(count) = self.establishing.get_mut(host_key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.establishing.remove(host_key);
            }
        }
    }

    fn take_stale(
        &mut self,
        endpoint: Option<&Endpoint>,
        now: Instant,
        config: &PoolConfig,
    ) -> Vec<ConnectionEntry> {
        let ids: Vec<String> = self
            .connections
            .values()
            .filter(|c| endpoint.map_or(true, |e| &c.endpoint == e))
            .filter(|c| c.is_stale(now, config.idle_timeout, config.keep_alive_timeout))
            .map(|c| c.id.clone())
            .collect();

        ids.iter()
            .filter_map(|id| self.connections.remove(id))
            .map(|mut entry| {
                entry.state = ConnectionState::Closing;
                entry
            })
            .collect()
    }

    /// Reuse an idle connection or reserve a slot for `endpoint`
    ///
    /// When only the global limit is in the way, the least recently used
    /// idle connection of another host is evicted into `evicted`.
    fn try_grant(
        &mut self,
        endpoint: &Endpoint,
        now: Instant,
        config: &PoolConfig,
        evicted: &mut Vec<ConnectionEntry>,
    ) -> Option<Grant> {
        let reusable = self
            .connections
            .values_mut()
            .filter(|c| c.state == ConnectionState::Idle && &c.endpoint == endpoint)
            .max_by_key(|c| c.last_used);
        if let Some(entry) = reusable {
            return Some(Grant::Reuse(entry.checkout(now)));
        }

        let host_key = endpoint.host_key();
        if self.host_count(&host_key) >= config.max_connections_per_host {
            return None;
        }

        if self.total_count() >= config.max_connections {
            let victim = self
                .connections
                .values()
                .filter(|c| c.state == ConnectionState::Idle && c.endpoint.host_key() != host_key)
                .min_by_key(|c| c.last_used)
                .map(|c| c.id.clone())?;
            if let Some(mut entry) = self.connections.remove(&victim) {
                debug!(connection_id = %entry.id, endpoint = %entry.endpoint, "evicting idle connection for another host");
                entry.state = ConnectionState::Closing;
                evicted.push(entry);
            }
        }

        self.reserve(host_key);
        Some(Grant::Create)
    }

    /// Give back a grant nobody will use
    fn undo(&mut self, grant: Grant, endpoint: &Endpoint) {
        match grant {
            Grant::Reuse(connection) => {
                if let Some(entry) = self.connections.get_mut(connection.id()) {
                    entry.state = ConnectionState::Idle;
                    entry.use_count = entry.use_count.saturating_sub(1);
                }
            }
            Grant::Create => self.unreserve(&endpoint.host_key()),
        }
    }

    /// Serve waiters in arrival order while limits allow
    fn dispatch(&mut self, now: Instant, config: &PoolConfig) -> Vec<ConnectionEntry> {
        let mut evicted = Vec::new();
        let mut index = 0;

        while index < self.waiters.len() {
            if self.waiters[index].tx.is_closed() {
                self.waiters.remove(index);
                continue;
            }

            let endpoint = self.waiters[index].endpoint.clone();
            match self.try_grant(&endpoint, now, config, &mut evicted) {
                Some(grant) => {
                    if let Some(waiter) = self.waiters.remove(index) {
                        if let Err(Ok(grant)) = waiter.tx.send(Ok(grant)) {
                            self.undo(grant, &waiter.endpoint);
                        }
                    }
                }
                None => index += 1,
            }
        }

        evicted
    }
}

/// Connection counts for one `host:port`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
}

/// Point-in-time view of the pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: usize,
    pub active: usize,
    pub idle: usize,
    pub establishing: usize,
    pub waiting: usize,
    pub hosts: BTreeMap<String, HostStats>,
}

struct Shared<C> {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    state: Mutex<PoolState>,
    clock: C,
    events: EventBus,
    shutdown: AtomicBool,
    next_waiter_id: AtomicU64,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

/// Bounded, per-host connection pool over a [`Transport`]
///
/// Cloning yields another handle to the same pool.
pub struct ConnectionPool<C: Clock = SystemClock> {
    shared: Arc<Shared<C>>,
}

impl<C: Clock> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl<C: Clock> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builder for [`ConnectionPool`]
pub struct ConnectionPoolBuilder<C: Clock = SystemClock> {
    config: PoolConfig,
    transport: Arc<dyn Transport>,
    clock: C,
    events: EventBus,
}

impl<C: Clock> ConnectionPoolBuilder<C> {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// Read time from `clock` (useful for testing)
    pub fn clock<C2: Clock>(self, clock: C2) -> ConnectionPoolBuilder<C2> {
        ConnectionPoolBuilder {
            config: self.config,
            transport: self.transport,
            clock,
            events: self.events,
        }
    }

    /// Validate the configuration and start the maintenance task
    pub fn build(self) -> CommonResult<ConnectionPool<C>> {
        self.config.validate()?;
        let pool = ConnectionPool {
            shared: Arc::new(Shared {
                config: self.config,
                transport: self.transport,
                state: Mutex::new(PoolState::default()),
                clock: self.clock,
                events: self.events,
                shutdown: AtomicBool::new(false),
                next_waiter_id: AtomicU64::new(0),
                maintenance: Mutex::new(None),
            }),
        };
        pool.start_maintenance();
        Ok(pool)
    }
}

impl ConnectionPool<SystemClock> {
    pub fn builder(transport: Arc<dyn Transport>) -> ConnectionPoolBuilder<SystemClock> {
        ConnectionPoolBuilder {
            config: PoolConfig::default(),
            transport,
            clock: SystemClock,
            events: EventBus::default(),
        }
    }

    pub fn new(config: PoolConfig, transport: Arc<dyn Transport>) -> CommonResult<Self> {
        Self::builder(transport).config(config).build()
    }
}

impl<C: Clock> ConnectionPool<C> {
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn events(&self) -> &EventBus {
        &self.shared.events
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    fn now(&self) -> Instant {
        self.shared.clock.now()
    }

    fn emit(&self, event: NetEvent) {
        self.shared.events.emit(event);
    }

    fn start_maintenance(&self) {
        let period = self.shared.config.maintenance_interval;
        if period.is_zero() {
            debug!("pool maintenance disabled");
            return;
        }

        let weak = Arc::downgrade(&self.shared);
        match Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    interval.tick().await;

                    loop {
                        interval.tick().await;

                        let Some(shared) = weak.upgrade() else {
                            break;
                        };
                        if shared.shutdown.load(Ordering::Acquire) {
                            break;
                        }
                        let pool = ConnectionPool { shared };
                        pool.run_maintenance().await;
                    }
                });
                *self.shared.maintenance.lock() = Some(handle);
            }
            Err(_) => {
                warn!("Skipping pool maintenance task start: no active Tokio runtime detected");
            }
        }
    }

    /// Lease a connection to `endpoint`
    ///
    /// Reuses an idle connection when one exists, otherwise establishes a
    /// new one if limits allow, otherwise waits in line.
    ///
    /// # Errors
    ///
    /// - `ConnectionFailed` when establishing fails (never retried here)
    /// - `ConnectionWaitTimeout` when no connection frees up in time
    /// - `ShuttingDown` once [`shutdown`](Self::shutdown) has begun
    #[instrument(skip(self, endpoint), fields(endpoint = %endpoint))]
    pub async fn acquire(&self, endpoint: &Endpoint) -> NetResult<Connection> {
        if self.is_shutting_down() {
            return Err(NetError::ShuttingDown);
        }

        let now = self.now();
        let config = &self.shared.config;
        let (admission, to_close) = {
            let mut st = self.shared.state.lock();
            let mut to_close = st.take_stale(Some(endpoint), now, config);
            if !to_close.is_empty() {
                let evicted = st.dispatch(now, config);
                to_close.extend(evicted);
            }

            let grant = if st.has_waiter_for(&endpoint.host_key()) {
                None
            } else {
                st.try_grant(endpoint, now, config, &mut to_close)
            };

            let admission = match grant {
                Some(grant) => Admission::Granted(grant),
                None => {
                    let (tx, rx) = oneshot::channel();
                    let id = self.shared.next_waiter_id.fetch_add(1, Ordering::Relaxed);
                    st.waiters.push_back(Waiter { id, endpoint: endpoint.clone(), tx });
                    Admission::Queued(id, rx)
                }
            };
            (admission, to_close)
        };
        self.close_detached(to_close);

        let grant = match admission {
            Admission::Granted(grant) => grant,
            Admission::Queued(id, rx) => self.wait_for_grant(id, rx, endpoint).await?,
        };

        match grant {
            Grant::Reuse(connection) => {
                debug!(connection_id = %connection.id(), uses = connection.use_count(), "reusing idle connection");
                Ok(connection)
            }
            Grant::Create => self.establish(endpoint).await,
        }
    }

    async fn wait_for_grant(
        &self,
        waiter_id: u64,
        rx: oneshot::Receiver<NetResult<Grant>>,
        endpoint: &Endpoint,
    ) -> NetResult<Grant> {
        let wait = self.shared.config.wait_timeout();
        debug!(waiter_id, ?wait, "waiting for a free connection");

        let mut pending =
            PendingWait { pool: self, waiter_id, endpoint: endpoint.clone(), rx: Some(rx) };
        let Some(rx) = pending.rx.as_mut() else {
            return Err(NetError::ShuttingDown);
        };

        match tokio::time::timeout(wait, rx).await {
            Ok(received) => {
                pending.rx = None;
                received.unwrap_or(Err(NetError::ShuttingDown))
            }
            Err(_) => match pending.abandon() {
                // Granted between the deadline and the removal
                Some(result) => result,
                None => {
                    warn!(waiter_id, ?wait, "timed out waiting for a connection");
                    Err(NetError::ConnectionWaitTimeout {
                        endpoint: endpoint.to_string(),
                        waited: wait,
                    })
                }
            },
        }
    }

    async fn establish(&self, endpoint: &Endpoint) -> NetResult<Connection> {
        let mut slot = Establishing { pool: self, host_key: endpoint.host_key(), armed: true };
        let limit = self.shared.config.connection_timeout;

        let connected =
            match tokio::time::timeout(limit, self.shared.transport.connect(endpoint, limit)).await
            {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(err @ NetError::ConnectionFailed { .. })) => Err(err),
                Ok(Err(err)) => Err(NetError::ConnectionFailed {
                    endpoint: endpoint.to_string(),
                    message: err.to_string(),
                }),
                Err(_) => Err(NetError::ConnectionFailed {
                    endpoint: endpoint.to_string(),
                    message: format!("not established within {limit:?}"),
                }),
            };

        let handle = match connected {
            Ok(handle) => handle,
            Err(err) => {
                warn!(error = %err, "failed to establish connection");
                self.emit(NetEvent::ConnectionError {
                    connection_id: None,
                    endpoint: endpoint.to_string(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        };

        let id = Uuid::new_v4().to_string();
        let entry = ConnectionEntry::new(
            id.clone(),
            endpoint.clone(),
            handle,
            self.shared.config.keep_alive,
            self.now(),
        );
        let lease = entry.lease();

        let rejected = {
            let mut st = self.shared.state.lock();
            st.unreserve(&slot.host_key);
            slot.armed = false;
            if self.is_shutting_down() {
                Some(entry)
            } else {
                st.connections.insert(id.clone(), entry);
                None
            }
        };
        if let Some(entry) = rejected {
            self.finish_close(entry).await;
            return Err(NetError::ShuttingDown);
        }

        info!(connection_id = %id, "connection established");
        self.emit(NetEvent::ConnectionCreated {
            connection_id: id,
            endpoint: endpoint.to_string(),
        });
        Ok(lease)
    }

    /// Return a leased connection to the idle set
    ///
    /// Only active connections are released; repeated or unknown ids are
    /// ignored and return `false`.
    pub fn release(&self, connection_id: &str) -> bool {
        let now = self.now();
        let (endpoint, evicted) = {
            let mut st = self.shared.state.lock();
            let Some(entry) = st.connections.get_mut(connection_id) else {
                debug!(connection_id, "release of unknown connection ignored");
                return false;
            };
            if entry.state != ConnectionState::Active {
                debug!(connection_id, state = %entry.state, "release of inactive connection ignored");
                return false;
            }
            entry.state = ConnectionState::Idle;
            entry.last_used = now;
            let endpoint = entry.endpoint.to_string();
            (endpoint, st.dispatch(now, &self.shared.config))
        };

        debug!(connection_id, "connection released");
        self.emit(NetEvent::ConnectionReleased {
            connection_id: connection_id.to_string(),
            endpoint,
        });
        self.close_detached(evicted);
        true
    }

    /// Remove a connection from the pool and close its transport
    ///
    /// Transport failures are reported as `connectionError` events. Returns
    /// `false` when the id is unknown (already closed).
    pub async fn close(&self, connection_id: &str) -> bool {
        let (entry, evicted) = {
            let mut st = self.shared.state.lock();
            let Some(mut entry) = st.connections.remove(connection_id) else {
                return false;
            };
            entry.state = ConnectionState::Closing;
            (entry, st.dispatch(self.now(), &self.shared.config))
        };

        self.close_detached(evicted);
        self.finish_close(entry).await;
        true
    }

    /// Synchronous variant of [`close`](Self::close) for drop paths
    fn discard(&self, connection_id: &str) {
        let removed = {
            let mut st = self.shared.state.lock();
            st.connections.remove(connection_id).map(|mut entry| {
                entry.state = ConnectionState::Closing;
                let mut entries = st.dispatch(self.now(), &self.shared.config);
                entries.push(entry);
                entries
            })
        };
        if let Some(entries) = removed {
            self.close_detached(entries);
        }
    }

    async fn finish_close(&self, mut entry: ConnectionEntry) {
        let endpoint = entry.endpoint.to_string();
        if let Err(err) = self.shared.transport.close(&entry.handle).await {
            warn!(connection_id = %entry.id, error = %err, "transport close failed");
            self.emit(NetEvent::ConnectionError {
                connection_id: Some(entry.id.clone()),
                endpoint: endpoint.clone(),
                error: err.to_string(),
            });
        }
        entry.state = ConnectionState::Closed;
        debug!(connection_id = %entry.id, uses = entry.use_count, state = %entry.state, "connection closed");
        self.emit(NetEvent::ConnectionClosed { connection_id: entry.id, endpoint });
    }

    fn close_detached(&self, entries: Vec<ConnectionEntry>) {
        if entries.is_empty() {
            return;
        }
        match Handle::try_current() {
            Ok(runtime) => {
                let pool = self.clone();
                runtime.spawn(async move {
                    for entry in entries {
                        pool.finish_close(entry).await;
                    }
                });
            }
            Err(_) => {
                warn!(
                    count = entries.len(),
                    "Dropping connections without transport close: no active Tokio runtime detected"
                );
            }
        }
    }

    /// Send one request to `url` over a pooled connection
    ///
    /// The connection is released afterwards, unless the failure carries no
    /// HTTP status (the connection itself is suspect), in which case it is
    /// closed.
    #[instrument(skip(self, options), fields(method = %options.method))]
    pub async fn request(&self, url: &str, options: RequestOptions) -> NetResult<Response> {
        let endpoint = Endpoint::parse(url)?;
        let connection = self.acquire(&endpoint).await?;
        let mut in_flight = InFlight { pool: self, connection_id: Some(connection.id().to_string()) };

        let request = OutboundRequest { url: url.to_string(), options };
        let send = self.shared.transport.send(connection.handle(), &request);
        let result = match request.options.timeout {
            Some(limit) => tokio::time::timeout(limit, send)
                .await
                .unwrap_or(Err(NetError::OperationTimeout { timeout: limit })),
            None => send.await,
        };

        if let Some(connection_id) = in_flight.connection_id.take() {
            match &result {
                Err(err) if err.status().is_none() => {
                    debug!(connection_id = %connection_id, error = %err, "closing connection after transport failure");
                    self.close(&connection_id).await;
                }
                _ => {
                    self.release(&connection_id);
                }
            }
        }
        result
    }

    /// Close stale idle connections now
    ///
    /// Returns how many were closed.
    #[instrument(skip(self))]
    pub async fn run_maintenance(&self) -> usize {
        let now = self.now();
        let (stale, evicted, remaining) = {
            let mut st = self.shared.state.lock();
            let stale = st.take_stale(None, now, &self.shared.config);
            let evicted =
                if stale.is_empty() { Vec::new() } else { st.dispatch(now, &self.shared.config) };
            (stale, evicted, st.connections.len())
        };

        let closed = stale.len();
        for entry in stale {
            self.finish_close(entry).await;
        }
        self.close_detached(evicted);

        if closed > 0 {
            info!(closed, remaining, "pool maintenance closed stale connections");
        }
        self.emit(NetEvent::MaintenanceCompleted { closed, remaining });
        closed
    }

    pub fn stats(&self) -> PoolStats {
        let st = self.shared.state.lock();
        let mut stats = PoolStats {
            establishing: st.establishing.values().sum(),
            waiting: st.waiters.len(),
            ..PoolStats::default()
        };

        for entry in st.connections.values() {
            let host = stats.hosts.entry(entry.endpoint.host_key()).or_default();
            host.total += 1;
            stats.total += 1;
            match entry.state {
                ConnectionState::Active => {
                    host.active += 1;
                    stats.active += 1;
                }
                ConnectionState::Idle => {
                    host.idle += 1;
                    stats.idle += 1;
                }
                ConnectionState::Closing | ConnectionState::Closed => {}
            }
        }
        stats
    }

    /// Snapshot of every pooled connection, ordered by endpoint
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let now = self.now();
        let mut infos: Vec<ConnectionInfo> =
            self.shared.state.lock().connections.values().map(|c| c.info(now)).collect();
        infos.sort_by(|a, b| a.endpoint.cmp(&b.endpoint).then_with(|| a.id.cmp(&b.id)));
        infos
    }

    /// Attach free-form metadata to a pooled connection
    pub fn set_metadata(
        &self,
        connection_id: &str,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> bool {
        match self.shared.state.lock().connections.get_mut(connection_id) {
            Some(entry) => {
                entry.metadata.insert(key.into(), value.into());
                true
            }
            None => false,
        }
    }

    /// Reject waiters, stop maintenance and close every connection
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.shared.maintenance.lock().take() {
            handle.abort();
        }

        let (waiters, entries) = {
            let mut st = self.shared.state.lock();
            let waiters: Vec<Waiter> = st.waiters.drain(..).collect();
            let entries: Vec<ConnectionEntry> =
                st.connections.drain().map(|(_, entry)| entry).collect();
            (waiters, entries)
        };

        for waiter in waiters {
            let _ = waiter.tx.send(Err(NetError::ShuttingDown));
        }

        let closed = entries.len();
        for mut entry in entries {
            entry.state = ConnectionState::Closing;
            self.finish_close(entry).await;
        }
        info!(closed, "connection pool shut down");
    }
}

/// A queued `acquire`; leaving the queue early returns any grant it got
struct PendingWait<'a, C: Clock> {
    pool: &'a ConnectionPool<C>,
    waiter_id: u64,
    endpoint: Endpoint,
    rx: Option<oneshot::Receiver<NetResult<Grant>>>,
}

impl<C: Clock> PendingWait<'_, C> {
    fn abandon(&mut self) -> Option<NetResult<Grant>> {
        let mut rx = self.rx.take()?;
        let waiter_id = self.waiter_id;
        self.pool.shared.state.lock().waiters.retain(|w| w.id != waiter_id);
        rx.try_recv().ok()
    }
}

impl<C: Clock> Drop for PendingWait<'_, C> {
    fn drop(&mut self) {
        if let Some(Ok(grant)) = self.abandon() {
            let evicted = {
                let mut st = self.pool.shared.state.lock();
                st.undo(grant, &self.endpoint);
                st.dispatch(self.pool.now(), &self.pool.shared.config)
            };
            self.pool.close_detached(evicted);
        }
    }
}

/// Reserved establishment slot; freed on failure or cancellation
struct Establishing<'a, C: Clock> {
    pool: &'a ConnectionPool<C>,
    host_key: String,
    armed: bool,
}

impl<C: Clock> Drop for Establishing<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let evicted = {
            let mut st = self.pool.shared.state.lock();
            st.unreserve(&self.host_key);
            st.dispatch(self.pool.now(), &self.pool.shared.config)
        };
        self.pool.close_detached(evicted);
    }
}

/// Connection used by an in-progress `request`; discarded if the request is
/// dropped mid-flight
struct InFlight<'a, C: Clock> {
    pool: &'a ConnectionPool<C>,
    connection_id: Option<String>,
}

impl<C: Clock> Drop for InFlight<'_, C> {
    fn drop(&mut self) {
        if let Some(connection_id) = self.connection_id.take() {
            self.pool.discard(&connection_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use synclink_common::time::MockClock;
    use tokio_test::task;
    use tokio_test::{assert_pending, assert_ready};

    use super::*;
    use crate::transport::TransportHandle;

    #[derive(Default)]
    struct MockTransport {
        connects: AtomicUsize,
        closes: AtomicUsize,
        fail_connect: AtomicBool,
        responses: Mutex<VecDeque<NetResult<Response>>>,
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn connect(
            &self,
            endpoint: &Endpoint,
            _timeout: Duration,
        ) -> NetResult<TransportHandle> {
            if self.fail_connect.load(Ordering::SeqCst) {
                return Err(NetError::ConnectionFailed {
                    endpoint: endpoint.to_string(),
                    message: "refused".to_string(),
                });
            }
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(TransportHandle::new(n))
        }

        async fn send(
            &self,
            _handle: &TransportHandle,
            _request: &OutboundRequest,
        ) -> NetResult<Response> {
            self.responses.lock().pop_front().unwrap_or_else(|| {
                Ok(Response {
                    status: 200,
                    headers: BTreeMap::new(),
                    data: serde_json::json!({"ok": true}),
                })
            })
        }

        async fn close(&self, _handle: &TransportHandle) -> NetResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config(per_host: usize, total: usize) -> PoolConfig {
        PoolConfig {
            max_connections: total,
            max_connections_per_host: per_host,
            maintenance_interval: Duration::ZERO,
            ..PoolConfig::default()
        }
    }

    fn endpoint(url: &str) -> Endpoint {
        Endpoint::parse(url).unwrap()
    }

    /// Validates a released connection is reused for the same endpoint.
    ///
    /// Assertions:
    /// - Second lease has the same id and a bumped use counter.
    /// - Only one transport connect happened.
    #[tokio::test]
    async fn test_reuse_after_release() {
        let transport = Arc::new(MockTransport::default());
        let pool = ConnectionPool::new(config(2, 10), transport.clone()).unwrap();
        let api = endpoint("https://api.example.com");

        let first = pool.acquire(&api).await.unwrap();
        assert!(pool.release(first.id()));
        let second = pool.acquire(&api).await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(second.use_count(), 2);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    /// Validates blocked acquires are served first come, first served.
    ///
    /// Assertions:
    /// - Both waiters stay pending while the only connection is leased.
    /// - The first waiter gets the released connection, the second keeps
    ///   waiting.
    #[tokio::test]
    async fn test_waiters_served_in_order() {
        let transport = Arc::new(MockTransport::default());
        let pool = ConnectionPool::new(config(1, 10), transport.clone()).unwrap();
        let api = endpoint("https://api.example.com");

        let held = pool.acquire(&api).await.unwrap();
        let mut first = task::spawn(pool.acquire(&api));
        let mut second = task::spawn(pool.acquire(&api));
        assert_pending!(first.poll());
        assert_pending!(second.poll());
        assert_eq!(pool.stats().waiting, 2);

        pool.release(held.id());

        assert!(first.is_woken());
        let granted = assert_ready!(first.poll()).unwrap();
        assert_eq!(granted.id(), held.id());
        assert_pending!(second.poll());
        assert_eq!(pool.stats().waiting, 1);
    }

    /// Validates a waiter that times out is removed from the wait list.
    #[tokio::test(start_paused = true)]
    async fn test_wait_timeout() {
        let transport = Arc::new(MockTransport::default());
        let pool = ConnectionPool::new(
            PoolConfig { acquire_timeout: Some(Duration::from_millis(100)), ..config(1, 10) },
            transport,
        )
        .unwrap();
        let api = endpoint("https://api.example.com");

        let _held = pool.acquire(&api).await.unwrap();
        let result = pool.acquire(&api).await;

        assert!(matches!(result, Err(NetError::ConnectionWaitTimeout { waited, .. }) if waited == Duration::from_millis(100)));
        assert_eq!(pool.stats().waiting, 0);
    }

    /// Validates repeated release and close are no-ops.
    #[tokio::test]
    async fn test_double_release_and_close() {
        let transport = Arc::new(MockTransport::default());
        let pool = ConnectionPool::new(config(2, 10), transport.clone()).unwrap();
        let conn = pool.acquire(&endpoint("https://api.example.com")).await.unwrap();

        assert!(pool.release(conn.id()));
        assert!(!pool.release(conn.id()));
        assert!(pool.close(conn.id()).await);
        assert!(!pool.close(conn.id()).await);

        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().total, 0);
    }

    /// Validates establishment failures surface and free the reserved slot.
    #[tokio::test]
    async fn test_connect_failure_frees_slot() {
        let transport = Arc::new(MockTransport::default());
        transport.fail_connect.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new(config(1, 10), transport.clone()).unwrap();
        let mut events = pool.events().subscribe();
        let api = endpoint("https://api.example.com");

        let result = pool.acquire(&api).await;
        assert!(matches!(result, Err(NetError::ConnectionFailed { .. })));
        assert_eq!(pool.stats().establishing, 0);
        assert_eq!(events.try_recv().unwrap().name(), "connectionError");

        transport.fail_connect.store(false, Ordering::SeqCst);
        assert!(pool.acquire(&api).await.is_ok());
    }

    /// Validates the global limit evicts another host's idle connection.
    ///
    /// Assertions:
    /// - A second host can connect when the global limit is reached but the
    ///   first host's connection is idle.
    /// - The evicted connection is gone from the pool.
    #[tokio::test]
    async fn test_global_limit_evicts_idle_other_host() {
        let transport = Arc::new(MockTransport::default());
        let pool = ConnectionPool::new(config(1, 1), transport.clone()).unwrap();

        let a = pool.acquire(&endpoint("https://a.example.com")).await.unwrap();
        pool.release(a.id());
        let b = pool.acquire(&endpoint("https://b.example.com")).await.unwrap();

        let stats = pool.stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.hosts.get("b.example.com:443").map(|h| h.active), Some(1));
        assert!(!stats.hosts.contains_key("a.example.com:443"));
        assert_ne!(a.id(), b.id());
    }

    /// Validates the maintenance sweep closes stale idle connections only.
    #[tokio::test]
    async fn test_maintenance_closes_stale() {
        let transport = Arc::new(MockTransport::default());
        let clock = MockClock::new();
        let pool = ConnectionPool::builder(transport.clone())
            .config(config(2, 10))
            .clock(clock.clone())
            .build()
            .unwrap();
        let api = endpoint("https://api.example.com");

        let idle = pool.acquire(&api).await.unwrap();
        let busy = pool.acquire(&api).await.unwrap();
        pool.release(idle.id());

        clock.advance(Duration::from_secs(61));
        let closed = pool.run_maintenance().await;

        assert_eq!(closed, 1);
        let remaining = pool.connections();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, busy.id());
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    /// Validates a stale idle connection is replaced during acquire.
    #[tokio::test]
    async fn test_acquire_skips_stale_connection() {
        let transport = Arc::new(MockTransport::default());
        let clock = MockClock::new();
        let pool = ConnectionPool::builder(transport.clone())
            .config(config(2, 10))
            .clock(clock.clone())
            .build()
            .unwrap();
        let api = endpoint("https://api.example.com");

        let first = pool.acquire(&api).await.unwrap();
        pool.release(first.id());
        clock.advance(Duration::from_secs(120));
        let second = pool.acquire(&api).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
    }

    /// Validates request releases on HTTP errors and closes on status-less
    /// failures.
    #[tokio::test]
    async fn test_request_connection_disposition() {
        let transport = Arc::new(MockTransport::default());
        let pool = ConnectionPool::new(config(2, 10), transport.clone()).unwrap();
        transport.responses.lock().extend([
            Err(NetError::transport("not found", Some(404))),
            Err(NetError::transport("reset by peer", None)),
        ]);

        let url = "https://api.example.com/items";
        let not_found = pool.request(url, RequestOptions::get()).await;
        assert_eq!(not_found.unwrap_err().status(), Some(404));
        assert_eq!(pool.stats().idle, 1);

        let reset = pool.request(url, RequestOptions::get()).await;
        assert!(reset.is_err());
        assert_eq!(pool.stats().total, 0);

        let ok = pool.request(url, RequestOptions::get()).await.unwrap();
        assert_eq!(ok.status, 200);
        assert_eq!(pool.stats().idle, 1);
    }

    /// Validates shutdown rejects waiters and new acquires.
    #[tokio::test]
    async fn test_shutdown_rejects_waiters() {
        let transport = Arc::new(MockTransport::default());
        let pool = ConnectionPool::new(config(1, 10), transport.clone()).unwrap();
        let api = endpoint("https://api.example.com");

        let _held = pool.acquire(&api).await.unwrap();
        let mut waiter = task::spawn(pool.acquire(&api));
        assert_pending!(waiter.poll());

        pool.shutdown().await;

        assert!(matches!(assert_ready!(waiter.poll()), Err(NetError::ShuttingDown)));
        assert!(matches!(pool.acquire(&api).await, Err(NetError::ShuttingDown)));
        assert_eq!(transport.closes.load(Ordering::SeqCst), 1);
    }

    /// Validates an abandoned acquire does not leak its grant.
    #[tokio::test]
    async fn test_cancelled_waiter_returns_grant() {
        let transport = Arc::new(MockTransport::default());
        let pool = ConnectionPool::new(config(1, 10), transport.clone()).unwrap();
        let api = endpoint("https://api.example.com");

        let held = pool.acquire(&api).await.unwrap();
        let mut waiter = task::spawn(pool.acquire(&api));
        assert_pending!(waiter.poll());

        pool.release(held.id());
        drop(waiter);

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.waiting, 0);
        let again = pool.acquire(&api).await.unwrap();
        assert_eq!(again.id(), held.id());
    }
}
