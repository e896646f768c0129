//! Process-wide server state shared by every connection.
//!
//! # Responsibilities
//! - Count total/active connections and requests (the concurrency limiter
//!   reads these)
//! - Cache the `date` header value, refreshed once a second
//! - Assemble the default response headers
//!
//! # Design Decisions
//! - Counters are atomics; decrements happen in guard `Drop` impls so an
//!   aborted connection or panicking task can never leak a slot
//! - The date is an `ArcSwap` so readers never block the ticker

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use arc_swap::ArcSwap;
use bytes::Bytes;
use tokio::sync::broadcast;

use crate::config::HttpConfig;
use crate::observability::metrics;

#[derive(Debug)]
pub struct ServerState {
    total_connections: AtomicU64,
    active_connections: AtomicUsize,
    total_requests: AtomicU64,
    active_requests: AtomicUsize,
    date: ArcSwap<Bytes>,
}

impl ServerState {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_connections: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
            active_requests: AtomicUsize::new(0),
            date: ArcSwap::from_pointee(current_date()),
        }
    }

    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::SeqCst)
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::SeqCst)
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// True when another request would exceed `limit`.
    pub fn at_request_limit(&self, limit: Option<usize>) -> bool {
        limit.is_some_and(|limit| self.active_requests() >= limit)
    }

    pub fn at_connection_limit(&self, limit: Option<usize>) -> bool {
        limit.is_some_and(|limit| self.active_connections() >= limit)
    }

    pub(crate) fn connection_opened(&self) {
        self.total_connections.fetch_add(1, Ordering::SeqCst);
        let active = self.active_connections.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_connection_opened(active);
    }

    pub(crate) fn connection_closed(&self) {
        let active = self.active_connections.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_connection_closed(active);
    }

    /// Count a request as in flight until the guard drops.
    pub fn track_request(self: &Arc<Self>) -> RequestGuard {
        self.total_requests.fetch_add(1, Ordering::SeqCst);
        let active = self.active_requests.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::record_active_requests(active);
        RequestGuard {
            state: Arc::clone(self),
        }
    }

    pub fn date_header(&self) -> Bytes {
        Bytes::clone(&self.date.load())
    }

    pub fn refresh_date(&self) {
        self.date.store(Arc::new(current_date()));
    }

    /// `server`, `date` and configured extra headers, in that order.
    pub fn default_headers(&self, config: &HttpConfig) -> Vec<(Bytes, Bytes)> {
        let mut headers = Vec::with_capacity(2 + config.headers.len());
        if config.server_header {
            headers.push((
                Bytes::from_static(b"server"),
                Bytes::from(config.server_name.clone()),
            ));
        }
        if config.date_header {
            headers.push((Bytes::from_static(b"date"), self.date_header()));
        }
        for (name, value) in &config.headers {
            headers.push((
                Bytes::from(name.to_ascii_lowercase()),
                Bytes::from(value.clone()),
            ));
        }
        headers
    }

    /// Refresh the cached date every second until shutdown.
    pub fn spawn_date_ticker(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> tokio::task::JoinHandle<()> {
        let state = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => state.refresh_date(),
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

fn current_date() -> Bytes {
    Bytes::from(httpdate::fmt_http_date(SystemTime::now()))
}

/// An in-flight request. Decrements the active count when dropped.
#[derive(Debug)]
pub struct RequestGuard {
    state: Arc<ServerState>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        let active = self.state.active_requests.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::record_active_requests(active);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_guard_counts() {
        let state = Arc::new(ServerState::new());
        assert!(!state.at_request_limit(Some(1)));

        let first = state.track_request();
        assert_eq!(state.active_requests(), 1);
        assert!(state.at_request_limit(Some(1)));
        assert!(!state.at_request_limit(None));

        let second = state.track_request();
        drop(first);
        assert_eq!(state.active_requests(), 1);
        drop(second);
        assert_eq!(state.active_requests(), 0);
        assert_eq!(state.total_requests(), 2);
    }

    #[test]
    fn default_headers_follow_config() {
        let state = ServerState::new();
        let mut config = HttpConfig::default();
        config.headers = vec![("X-Served-By".to_string(), "edge-1".to_string())];

        let headers = state.default_headers(&config);
        let names: Vec<_> = headers.iter().map(|(n, _)| n.clone()).collect();
        assert_eq!(names, vec!["server", "date", "x-served-by"]);

        config.server_header = false;
        config.date_header = false;
        assert_eq!(state.default_headers(&config).len(), 1);
    }

    #[test]
    fn date_is_http_formatted() {
        let state = ServerState::new();
        let date = state.date_header();
        let text = std::str::from_utf8(&date).unwrap();
        assert!(httpdate::parse_http_date(text).is_ok());
    }
}
