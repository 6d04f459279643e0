use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::transport::{Endpoint, TransportHandle, TransportKind};

/// Lifecycle of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Active,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Pool-owned record of one connection
#[derive(Debug)]
pub(crate) struct ConnectionEntry {
    pub(crate) id: String,
    pub(crate) endpoint: Endpoint,
    pub(crate) state: ConnectionState,
    pub(crate) created_at: Instant,
    pub(crate) last_used: Instant,
    pub(crate) use_count: u64,
    pub(crate) keep_alive: bool,
    pub(crate) handle: TransportHandle,
    pub(crate) metadata: BTreeMap<String, String>,
}

impl ConnectionEntry {
    pub(crate) fn new(
        id: String,
        endpoint: Endpoint,
        handle: TransportHandle,
        keep_alive: bool,
        now: Instant,
    ) -> Self {
        let mut metadata = BTreeMap::new();
        metadata.insert("secure".to_string(), endpoint.kind().is_secure().to_string());
        Self {
            id,
            endpoint,
            state: ConnectionState::Active,
            created_at: now,
            last_used: now,
            use_count: 1,
            keep_alive,
            handle,
            metadata,
        }
    }

    /// Idle for longer than `idle_timeout`, or past its keep-alive lifetime
    pub(crate) fn is_stale(
        &self,
        now: Instant,
        idle_timeout: Duration,
        keep_alive_timeout: Duration,
    ) -> bool {
        if self.state != ConnectionState::Idle {
            return false;
        }
        let idle_for = now.saturating_duration_since(self.last_used);
        let age = now.saturating_duration_since(self.created_at);
        idle_for > idle_timeout || (self.keep_alive && age > keep_alive_timeout)
    }

    /// Mark active for a new lease
    pub(crate) fn checkout(&mut self, now: Instant) -> Connection {
        self.state = ConnectionState::Active;
        self.use_count += 1;
        self.last_used = now;
        self.lease()
    }

    pub(crate) fn lease(&self) -> Connection {
        Connection {
            id: self.id.clone(),
            endpoint: self.endpoint.clone(),
            handle: self.handle.clone(),
            use_count: self.use_count,
        }
    }

    pub(crate) fn info(&self, now: Instant) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id.clone(),
            endpoint: self.endpoint.to_string(),
            kind: self.endpoint.kind(),
            state: self.state,
            use_count: self.use_count,
            age_ms: now.saturating_duration_since(self.created_at).as_millis() as u64,
            idle_ms: now.saturating_duration_since(self.last_used).as_millis() as u64,
            keep_alive: self.keep_alive,
            metadata: self.metadata.clone(),
        }
    }
}

/// A connection checked out of the pool
///
/// Hand it back with [`ConnectionPool::release`](super::ConnectionPool::release)
/// or discard it with [`ConnectionPool::close`](super::ConnectionPool::close).
#[derive(Debug, Clone)]
pub struct Connection {
    id: String,
    endpoint: Endpoint,
    handle: TransportHandle,
    use_count: u64,
}

impl Connection {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn handle(&self) -> &TransportHandle {
        &self.handle
    }

    /// Number of leases including this one
    pub fn use_count(&self) -> u64 {
        self.use_count
    }
}

/// Read-only snapshot of a pooled connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub endpoint: String,
    pub kind: TransportKind,
    pub state: ConnectionState,
    pub use_count: u64,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub keep_alive: bool,
    pub metadata: BTreeMap<String, String>,
}
