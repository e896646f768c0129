//! Process-level startup/shutdown handshake with the application.
//!
//! # Responsibilities
//! - Run the application once with a `lifespan` scope for the whole
//!   process lifetime
//! - Deliver `lifespan.startup` / `lifespan.shutdown` and wait for the
//!   matching `.complete` or `.failed` reply
//!
//! # Design Decisions
//! - In `auto` mode an application that fails or returns without replying
//!   is taken not to support the protocol: logged once, then ignored
//! - In `on` mode the same failure aborts startup
//! - Waiting is bounded by the configured lifespan timeout
//!
//! # States
//! ```text
//! NotStarted → Starting → Started → ShuttingDown → Stopped
//!                  ↘                      ↘
//!               FailedStartup          FailedShutdown
//! ```

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures_util::FutureExt;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::app::{self, AppEvent, Call, CycleId, LoadedApp, Outcome};
use crate::config::LifespanMode;
use crate::http::cycle::SendError;
use crate::http::message::Message;
use crate::http::scope::{LifespanScope, ProtocolInfo, Scope};
use crate::observability::logging::{APP_TARGET, ERROR_TARGET};

const LIFESPAN_CYCLE: CycleId = CycleId(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifespanState {
    NotStarted,
    Starting,
    Started,
    FailedStartup,
    ShuttingDown,
    Stopped,
    FailedShutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifespanError {
    #[error("application startup failed: {0}")]
    StartupFailed(String),
    #[error("application shutdown failed: {0}")]
    ShutdownFailed(String),
    #[error("application raised during lifespan: {0}")]
    Application(String),
    #[error("timed out waiting for '{0}' reply")]
    Timeout(&'static str),
}

/// Which half of the handshake is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Startup,
    Shutdown,
}

impl Phase {
    fn request(self) -> Message {
        match self {
            Phase::Startup => Message::LifespanStartup,
            Phase::Shutdown => Message::LifespanShutdown,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Phase::Startup => "lifespan.startup",
            Phase::Shutdown => "lifespan.shutdown",
        }
    }
}

pub struct Lifespan {
    app: LoadedApp,
    mode: LifespanMode,
    timeout: Duration,
    state: LifespanState,
    events: Option<mpsc::Receiver<AppEvent>>,
    inbox: VecDeque<Message>,
    pending_receive: Option<oneshot::Sender<Message>>,
    /// The application turned out not to implement the protocol.
    unsupported: bool,
    task_done: bool,
}

impl Lifespan {
    pub fn new(app: LoadedApp, mode: LifespanMode, timeout: Duration) -> Self {
        Self {
            app,
            mode,
            timeout,
            state: LifespanState::NotStarted,
            events: None,
            inbox: VecDeque::new(),
            pending_receive: None,
            unsupported: false,
            task_done: false,
        }
    }

    pub fn state(&self) -> LifespanState {
        self.state
    }

    /// True once the application has shown it does not speak the protocol.
    pub fn is_unsupported(&self) -> bool {
        self.unsupported
    }

    /// Run the startup half. On error the server must not accept traffic.
    pub async fn startup(&mut self) -> Result<(), LifespanError> {
        if self.mode == LifespanMode::Off {
            self.state = LifespanState::Started;
            return Ok(());
        }
        tracing::info!(target: ERROR_TARGET, "Waiting for application startup.");
        self.state = LifespanState::Starting;
        self.spawn_app();

        match self.exchange(Phase::Startup).await {
            Ok(()) => {
                self.state = LifespanState::Started;
                if !self.unsupported {
                    tracing::info!(target: ERROR_TARGET, "Application startup complete.");
                }
                Ok(())
            }
            Err(err) => {
                self.state = LifespanState::FailedStartup;
                tracing::error!(target: ERROR_TARGET, error = %err, "Application startup failed. Exiting.");
                Err(err)
            }
        }
    }

    /// Run the shutdown half. A no-op when startup never reached the app.
    pub async fn shutdown(&mut self) -> Result<(), LifespanError> {
        if self.mode == LifespanMode::Off || self.unsupported || self.task_done {
            self.state = LifespanState::Stopped;
            return Ok(());
        }
        if self.state != LifespanState::Started {
            return Ok(());
        }
        tracing::info!(target: ERROR_TARGET, "Waiting for application shutdown.");
        self.state = LifespanState::ShuttingDown;

        let result = self.exchange(Phase::Shutdown).await;
        self.events = None;
        match result {
            Ok(()) => {
                self.state = LifespanState::Stopped;
                tracing::info!(target: ERROR_TARGET, "Application shutdown complete.");
                Ok(())
            }
            Err(err) => {
                self.state = LifespanState::FailedShutdown;
                tracing::error!(target: ERROR_TARGET, error = %err, "Application shutdown failed.");
                Err(err)
            }
        }
    }

    fn spawn_app(&mut self) {
        let (tx, rx) = mpsc::channel(8);
        let (receive, send) = app::handles(LIFESPAN_CYCLE, tx.clone());
        let scope = Scope::Lifespan(LifespanScope {
            protocol: ProtocolInfo::new(self.app.interface()),
        });
        let call = self.app.call(scope, receive, send);
        tokio::spawn(async move {
            let result = AssertUnwindSafe(call).catch_unwind().await;
            let _ = tx
                .send(AppEvent::finished(LIFESPAN_CYCLE, Outcome::from_result(result)))
                .await;
        });
        self.events = Some(rx);
    }

    async fn exchange(&mut self, phase: Phase) -> Result<(), LifespanError> {
        self.offer(phase.request());
        let timeout = self.timeout;
        match tokio::time::timeout(timeout, self.await_reply(phase)).await {
            Ok(result) => result,
            Err(_) => Err(LifespanError::Timeout(phase.name())),
        }
    }

    fn offer(&mut self, message: Message) {
        match self.pending_receive.take() {
            Some(reply) => {
                let _ = reply.send(message);
            }
            None => self.inbox.push_back(message),
        }
    }

    async fn await_reply(&mut self, phase: Phase) -> Result<(), LifespanError> {
        loop {
            let event = match self.events.as_mut() {
                Some(events) => events.recv().await,
                None => None,
            };
            let Some(AppEvent { call, .. }) = event else {
                return Ok(());
            };
            match call {
                Call::Receive(reply) => match self.inbox.pop_front() {
                    Some(message) => {
                        let _ = reply.send(message);
                    }
                    None => self.pending_receive = Some(reply),
                },
                Call::Send(message, reply) => {
                    tracing::trace!(target: APP_TARGET, "Send {}", message.summary());
                    match (phase, message) {
                        (Phase::Startup, Message::LifespanStartupComplete)
                        | (Phase::Shutdown, Message::LifespanShutdownComplete) => {
                            let _ = reply.send(Ok(()));
                            return Ok(());
                        }
                        (Phase::Startup, Message::LifespanStartupFailed { message }) => {
                            let _ = reply.send(Ok(()));
                            return Err(LifespanError::StartupFailed(message));
                        }
                        (Phase::Shutdown, Message::LifespanShutdownFailed { message }) => {
                            let _ = reply.send(Ok(()));
                            return Err(LifespanError::ShutdownFailed(message));
                        }
                        (_, other) => {
                            let _ = reply.send(Err(SendError::UnexpectedMessage {
                                expected: match phase {
                                    Phase::Startup => "lifespan.startup.complete",
                                    Phase::Shutdown => "lifespan.shutdown.complete",
                                },
                                received: other.message_type(),
                            }));
                        }
                    }
                }
                Call::Finished(outcome) => {
                    self.task_done = true;
                    return self.on_finished(phase, outcome);
                }
            }
        }
    }

    fn on_finished(&mut self, phase: Phase, outcome: Outcome) -> Result<(), LifespanError> {
        match outcome {
            Outcome::Returned => {
                if phase == Phase::Startup {
                    self.mark_unsupported();
                }
                Ok(())
            }
            Outcome::Failed(err) | Outcome::Panicked(err) => {
                if self.mode == LifespanMode::Auto && phase == Phase::Startup {
                    tracing::debug!(target: ERROR_TARGET, error = %err, "Lifespan application raised");
                    self.mark_unsupported();
                    return Ok(());
                }
                tracing::error!(target: ERROR_TARGET, error = %err, "Exception in 'lifespan' protocol");
                Err(LifespanError::Application(err))
            }
        }
    }

    fn mark_unsupported(&mut self) {
        self.unsupported = true;
        tracing::info!(target: ERROR_TARGET, "Lifespan protocol appears unsupported.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppError, AppResult, Receive, Sender};

    fn lifespan(app: LoadedApp, mode: LifespanMode) -> Lifespan {
        Lifespan::new(app, mode, Duration::from_secs(5))
    }

    async fn well_behaved(_scope: Scope, receive: Receive, send: Sender) -> AppResult {
        loop {
            match receive.recv().await {
                Message::LifespanStartup => send.send(Message::LifespanStartupComplete).await?,
                Message::LifespanShutdown => {
                    send.send(Message::LifespanShutdownComplete).await?;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn full_handshake() {
        let mut lifespan = lifespan(LoadedApp::new(well_behaved), LifespanMode::On);
        lifespan.startup().await.unwrap();
        assert_eq!(lifespan.state(), LifespanState::Started);
        lifespan.shutdown().await.unwrap();
        assert_eq!(lifespan.state(), LifespanState::Stopped);
    }

    #[tokio::test]
    async fn startup_failure_carries_message() {
        let app = LoadedApp::new(|_scope: Scope, receive: Receive, send: Sender| async move {
            receive.recv().await;
            send.send(Message::LifespanStartupFailed {
                message: "database unreachable".to_string(),
            })
            .await?;
            Ok::<(), AppError>(())
        });
        let mut lifespan = lifespan(app, LifespanMode::Auto);
        let err = lifespan.startup().await.unwrap_err();
        assert_eq!(err, LifespanError::StartupFailed("database unreachable".to_string()));
        assert_eq!(lifespan.state(), LifespanState::FailedStartup);
    }

    #[tokio::test]
    async fn auto_mode_tolerates_unsupported_apps() {
        let app = LoadedApp::new(|scope: Scope, _receive: Receive, _send: Sender| async move {
            if scope.scope_type() != "http" {
                return Err("unsupported scope".into());
            }
            Ok::<(), AppError>(())
        });
        let mut lifespan = lifespan(app.clone(), LifespanMode::Auto);
        lifespan.startup().await.unwrap();
        assert!(lifespan.is_unsupported());
        lifespan.shutdown().await.unwrap();

        let mut strict = self::lifespan(app, LifespanMode::On);
        assert!(matches!(strict.startup().await, Err(LifespanError::Application(_))));
    }

    async fn never_called(_scope: Scope, _receive: Receive, _send: Sender) -> AppResult {
        panic!("must not be called");
    }

    #[tokio::test]
    async fn off_mode_never_calls_the_app() {
        let mut lifespan = lifespan(LoadedApp::new(never_called), LifespanMode::Off);
        lifespan.startup().await.unwrap();
        lifespan.shutdown().await.unwrap();
        assert_eq!(lifespan.state(), LifespanState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_app_times_out() {
        let app = LoadedApp::new(|_scope: Scope, _receive: Receive, _send: Sender| async move {
            std::future::pending::<()>().await;
            Ok::<(), AppError>(())
        });
        let mut lifespan = lifespan(app, LifespanMode::On);
        assert_eq!(
            lifespan.startup().await,
            Err(LifespanError::Timeout("lifespan.startup"))
        );
    }
}
