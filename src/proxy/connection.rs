use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tracing::debug;

/// Per-connection live state.
struct ConnectionInfo {
    peer: SocketAddr,
    connected_at: Instant,
    requests: AtomicU64,
}

/// Thread-safe tracker for open client connections.
///
/// Connections are identified by a monotonically increasing `u64` ID.
pub struct ConnectionTracker {
    next_id: AtomicU64,
    active: DashMap<u64, ConnectionInfo>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            active: DashMap::new(),
        }
    }

    /// Register a new connection. The returned guard unregisters it on drop.
    fn register(self: &Arc<Self>, peer: SocketAddr) -> ConnectionGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active.insert(
            id,
            ConnectionInfo {
                peer,
                connected_at: Instant::now(),
                requests: AtomicU64::new(0),
            },
        );
        debug!(connection_id = id, peer = %peer, "Connection registered");

        ConnectionGuard {
            connections: Arc::clone(self),
            id,
        }
    }

    /// Register a new connection unless `limit` connections are already
    /// open. Must be called from the accept loop, before the connection is
    /// handed to its own task.
    pub fn try_register(self: &Arc<Self>, peer: SocketAddr, limit: usize) -> Option<ConnectionGuard> {
        if self.active.len() >= limit {
            return None;
        }
        Some(self.register(peer))
    }

    fn remove(&self, id: u64) {
        if let Some((_, info)) = self.active.remove(&id) {
            debug!(
                connection_id = id,
                peer = %info.peer,
                duration_secs = info.connected_at.elapsed().as_secs(),
                requests = info.requests.load(Ordering::Relaxed),
                "Connection removed"
            );
        }
    }

    pub fn increment_requests(&self, id: u64) {
        if let Some(entry) = self.active.get(&id) {
            entry.requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a connection registered for as long as it lives.
pub struct ConnectionGuard {
    connections: Arc<ConnectionTracker>,
    id: u64,
}

impl ConnectionGuard {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.connections.remove(self.id);
    }
}
