//! Server orchestration.
//!
//! # Responsibilities
//! - Run the lifespan startup handshake before accepting anything
//! - Accept connections, enforcing the connection limit with an immediate 503
//! - Stop accepting on shutdown or once the request limit is reached
//! - Drain open connections (bounded by the graceful timeout), then run the
//!   lifespan shutdown handshake
//!
//! # Data Flow
//! ```text
//! Server::run
//!     → Lifespan::startup        (failure: ServerError::StartupFailed)
//!     → accept loop              (Listener → ConnectionGuard → serve_connection)
//!     → Shutdown::trigger        (signal, max_requests, or caller)
//!     → wait_for_drain           (graceful_shutdown timeout)
//!     → Lifespan::shutdown
//! ```

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::app::LoadedApp;
use crate::config::ServerConfig;
use crate::http::response::service_unavailable;
use crate::lifecycle::{Lifespan, LifespanError, Shutdown};
use crate::net::connection::wait_for_drain;
use crate::net::{serve_connection, ConnectionContext, ConnectionGuard, Listener, ListenerError};
use crate::observability::logging::ERROR_TARGET;
use crate::observability::metrics;
use crate::state::ServerState;
use crate::upgrade::UpgradeHandler;

/// How often the accept loop checks the request limit.
const TICK: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("application startup failed")]
    StartupFailed(#[source] LifespanError),
    #[error("application shutdown failed")]
    ShutdownFailed(#[source] LifespanError),
}

impl ServerError {
    /// Process exit status for this error. Startup failure is reported
    /// distinctly so supervisors can tell it apart from other crashes.
    pub fn exit_code(&self) -> i32 {
        match self {
            ServerError::StartupFailed(_) => 3,
            _ => 1,
        }
    }
}

pub struct Server {
    config: Arc<ServerConfig>,
    state: Arc<ServerState>,
    app: LoadedApp,
    upgrade: Option<Arc<dyn UpgradeHandler>>,
    shutdown: Shutdown,
}

impl Server {
    pub fn new(config: ServerConfig, app: LoadedApp) -> Self {
        let app = app.with_interface_mode(config.http.interface);
        Self {
            config: Arc::new(config),
            state: Arc::new(ServerState::new()),
            app,
            upgrade: None,
            shutdown: Shutdown::new(),
        }
    }

    pub fn with_upgrade_handler(mut self, handler: Arc<dyn UpgradeHandler>) -> Self {
        self.upgrade = Some(handler);
        self
    }

    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Handle that stops the server when triggered.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = Listener::bind(&self.config.listener)?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn serve(self, listener: Listener) -> Result<(), ServerError> {
        let mut lifespan = Lifespan::new(
            self.app.clone(),
            self.config.lifespan.mode,
            self.config.timeouts.lifespan(),
        );
        lifespan.startup().await.map_err(ServerError::StartupFailed)?;

        let ticker = self.state.spawn_date_ticker(self.shutdown.subscribe());
        let ctx = ConnectionContext {
            config: Arc::clone(&self.config),
            state: Arc::clone(&self.state),
            app: self.app.clone(),
            upgrade: self.upgrade.clone(),
        };

        tracing::info!(
            target: ERROR_TARGET,
            address = %listener.local_addr(),
            "Server listening on http://{}",
            listener.local_addr()
        );
        let mut connections = self.accept_loop(&listener, &ctx).await;
        drop(listener);

        self.drain(&mut connections).await;
        let _ = ticker.await;

        lifespan.shutdown().await.map_err(ServerError::ShutdownFailed)?;
        tracing::info!(target: ERROR_TARGET, "Finished server process");
        Ok(())
    }

    async fn accept_loop(&self, listener: &Listener, ctx: &ConnectionContext) -> JoinSet<()> {
        let mut connections = JoinSet::new();
        let mut shutdown = self.shutdown.subscribe();
        let mut tick = tokio::time::interval(TICK);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => break,

                _ = tick.tick() => {
                    if self.request_limit_reached() {
                        tracing::warn!(target: ERROR_TARGET, "Maximum request limit exceeded. Terminating process.");
                        self.shutdown.trigger();
                        break;
                    }
                }

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(err) => {
                            tracing::error!(target: ERROR_TARGET, error = %err, "Accept failed");
                            continue;
                        }
                    };
                    if self.state.at_connection_limit(self.config.limits.max_connections) {
                        tracing::warn!(target: ERROR_TARGET, peer = %peer, "Exceeded connection limit.");
                        metrics::record_rejected("connections");
                        connections.spawn(reject(stream, service_unavailable_response(&self.state, &self.config)));
                        continue;
                    }

                    let guard = ConnectionGuard::new(&self.state);
                    let local = stream.local_addr().ok();
                    let ctx = ctx.clone();
                    let shutdown = self.shutdown.subscribe();
                    connections.spawn(async move {
                        tracing::trace!(connection_id = %guard.id(), peer = %peer, "Serving connection");
                        serve_connection(stream, local, Some(peer), ctx, shutdown).await;
                        drop(guard);
                    });
                }

                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
        connections
    }

    fn request_limit_reached(&self) -> bool {
        self.config
            .limits
            .max_requests
            .is_some_and(|limit| self.state.total_requests() >= limit)
    }

    async fn drain(&self, connections: &mut JoinSet<()>) {
        let active = self.state.active_connections();
        if active > 0 {
            tracing::info!(target: ERROR_TARGET, active, "Waiting for connections to close.");
        }
        match self.config.timeouts.graceful_shutdown() {
            Some(limit) => {
                if tokio::time::timeout(limit, wait_for_drain(&self.state)).await.is_err() {
                    tracing::error!(
                        target: ERROR_TARGET,
                        remaining = connections.len(),
                        "Cancel {} running connection(s), timeout graceful shutdown exceeded",
                        connections.len()
                    );
                    connections.abort_all();
                }
            }
            None => wait_for_drain(&self.state).await,
        }
        while connections.join_next().await.is_some() {}
    }
}

fn service_unavailable_response(state: &ServerState, config: &ServerConfig) -> bytes::Bytes {
    let defaults = state.default_headers(&config.http);
    let pairs: Vec<(&[u8], &[u8])> = defaults.iter().map(|(n, v)| (&n[..], &v[..])).collect();
    service_unavailable(&pairs)
}

async fn reject(mut stream: TcpStream, response: bytes::Bytes) {
    let _ = stream.write_all(&response).await;
    let _ = stream.shutdown().await;
}
