//! Connection identity and lifetime tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Count active connections in [`ServerState`] for the lifetime of a guard
//! - Let graceful shutdown wait for connections to drain

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::state::ServerState;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements the active connection count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    state: Arc<ServerState>,
    id: ConnectionId,
}

impl ConnectionGuard {
    /// Record a new active connection.
    pub fn new(state: &Arc<ServerState>) -> Self {
        state.connection_opened();
        Self {
            state: Arc::clone(state),
            id: ConnectionId::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.connection_closed();
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Wait until every connection guard has been dropped.
pub async fn wait_for_drain(state: &ServerState) {
    while state.active_connections() > 0 {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id1.to_string().starts_with("conn-"));
    }

    #[test]
    fn guards_count_connections() {
        let state = Arc::new(ServerState::new());
        assert_eq!(state.active_connections(), 0);

        let guard1 = ConnectionGuard::new(&state);
        let guard2 = ConnectionGuard::new(&state);
        assert_eq!(state.active_connections(), 2);
        assert!(state.at_connection_limit(Some(2)));

        drop(guard1);
        assert_eq!(state.active_connections(), 1);
        drop(guard2);
        assert_eq!(state.active_connections(), 0);
        assert_eq!(state.total_connections(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_guards() {
        let state = Arc::new(ServerState::new());
        let guard = ConnectionGuard::new(&state);
        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { wait_for_drain(&state).await })
        };
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!waiter.is_finished());
        drop(guard);
        waiter.await.unwrap();
    }
}
