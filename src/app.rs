//! Application boundary.
//!
//! # Responsibilities
//! - Define the two supported calling conventions
//! - Normalise both into one invocation shape ([`LoadedApp`]) at load time
//! - Provide the `receive`/`send` handles an application talks through
//!
//! # Design Decisions
//! - Handles never touch connection state directly; every call is an
//!   [`AppEvent`] on a bounded channel, answered over a oneshot
//! - A closed channel means the other side is gone: `receive` yields
//!   `http.disconnect`, `send` succeeds silently
//! - Applications are boxed futures, so closures work as applications

use std::error::Error;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::config::InterfaceMode;
use crate::http::cycle::SendError;
use crate::http::message::Message;
use crate::http::scope::{Interface, Scope};

/// Error an application may fail with.
pub type AppError = Box<dyn Error + Send + Sync>;

pub type AppResult = Result<(), AppError>;

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// Three-argument convention: `app(scope, receive, send)`.
pub trait Application: Send + Sync + 'static {
    fn call(&self, scope: Scope, receive: Receive, send: Sender) -> BoxFuture<AppResult>;
}

impl<F, Fut> Application for F
where
    F: Fn(Scope, Receive, Sender) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AppResult> + Send + 'static,
{
    fn call(&self, scope: Scope, receive: Receive, send: Sender) -> BoxFuture<AppResult> {
        Box::pin((self)(scope, receive, send))
    }
}

/// Per-scope instance produced by an [`ApplicationFactory`].
pub type Instance = Box<dyn FnOnce(Receive, Sender) -> BoxFuture<AppResult> + Send>;

/// Two-argument convention: `app(scope)` builds an instance, which is then
/// run with `(receive, send)`.
pub trait ApplicationFactory: Send + Sync + 'static {
    fn instantiate(&self, scope: Scope) -> Instance;
}

impl<F, I, Fut> ApplicationFactory for F
where
    F: Fn(Scope) -> I + Send + Sync + 'static,
    I: FnOnce(Receive, Sender) -> Fut + Send + 'static,
    Fut: Future<Output = AppResult> + Send + 'static,
{
    fn instantiate(&self, scope: Scope) -> Instance {
        let instance = (self)(scope);
        Box::new(move |receive, send| -> BoxFuture<AppResult> { Box::pin(instance(receive, send)) })
    }
}

#[derive(Clone)]
enum Convention {
    ThreeArg(Arc<dyn Application>),
    TwoArg(Arc<dyn ApplicationFactory>),
}

/// An application normalised to a single invocation shape.
///
/// The reported interface version (`3.0` or `2.0`) is decided here, once,
/// and written into every scope the application sees.
#[derive(Clone)]
pub struct LoadedApp {
    convention: Convention,
    interface: Interface,
}

impl LoadedApp {
    pub fn new(app: impl Application) -> Self {
        Self {
            convention: Convention::ThreeArg(Arc::new(app)),
            interface: Interface::V3,
        }
    }

    pub fn from_factory(factory: impl ApplicationFactory) -> Self {
        Self {
            convention: Convention::TwoArg(Arc::new(factory)),
            interface: Interface::V2,
        }
    }

    /// Override the reported interface. `auto` keeps the detected one.
    pub fn with_interface_mode(mut self, mode: InterfaceMode) -> Self {
        match mode {
            InterfaceMode::Auto => {}
            InterfaceMode::V3 => self.interface = Interface::V3,
            InterfaceMode::V2 => self.interface = Interface::V2,
        }
        self
    }

    pub fn interface(&self) -> Interface {
        self.interface
    }

    /// Invoke the application. Nothing runs until the future is polled, so
    /// a panic while building the instance surfaces from the future.
    pub fn call(&self, mut scope: Scope, receive: Receive, send: Sender) -> BoxFuture<AppResult> {
        scope.set_interface(self.interface);
        let convention = self.convention.clone();
        Box::pin(async move {
            match convention {
                Convention::ThreeArg(app) => app.call(scope, receive, send).await,
                Convention::TwoArg(factory) => factory.instantiate(scope)(receive, send).await,
            }
        })
    }
}

impl std::fmt::Debug for LoadedApp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedApp")
            .field("interface", &self.interface.version())
            .finish()
    }
}

/// Which exchange an [`AppEvent`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CycleId(pub(crate) u64);

impl std::fmt::Display for CycleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cycle-{}", self.0)
    }
}

/// How an application task ended.
#[derive(Debug)]
pub enum Outcome {
    Returned,
    Failed(String),
    Panicked(String),
}

impl Outcome {
    pub(crate) fn from_result(result: std::thread::Result<AppResult>) -> Self {
        match result {
            Ok(Ok(())) => Outcome::Returned,
            Ok(Err(err)) => Outcome::Failed(err.to_string()),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "application panicked".to_string());
                Outcome::Panicked(message)
            }
        }
    }
}

pub(crate) enum Call {
    Receive(oneshot::Sender<Message>),
    Send(Message, oneshot::Sender<Result<(), SendError>>),
    Finished(Outcome),
}

/// A call made by an application task, to be handled by whoever owns the
/// exchange (a connection engine or the lifespan handshake).
pub struct AppEvent {
    pub(crate) cycle: CycleId,
    pub(crate) call: Call,
}

impl AppEvent {
    pub fn cycle(&self) -> CycleId {
        self.cycle
    }

    pub(crate) fn finished(cycle: CycleId, outcome: Outcome) -> Self {
        Self {
            cycle,
            call: Call::Finished(outcome),
        }
    }
}

impl std::fmt::Debug for AppEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let call = match &self.call {
            Call::Receive(_) => "receive".to_string(),
            Call::Send(message, _) => format!("send {}", message.summary()),
            Call::Finished(outcome) => format!("finished {:?}", outcome),
        };
        f.debug_struct("AppEvent")
            .field("cycle", &self.cycle)
            .field("call", &call)
            .finish()
    }
}

/// Build the handle pair for one exchange.
pub(crate) fn handles(cycle: CycleId, events: mpsc::Sender<AppEvent>) -> (Receive, Sender) {
    (
        Receive {
            cycle,
            events: events.clone(),
        },
        Sender { cycle, events },
    )
}

/// The application's `receive` callable.
#[derive(Clone)]
pub struct Receive {
    cycle: CycleId,
    events: mpsc::Sender<AppEvent>,
}

impl Receive {
    /// Next inbound message. Once the exchange is gone this keeps
    /// returning `http.disconnect`.
    pub async fn recv(&self) -> Message {
        let (tx, rx) = oneshot::channel();
        let event = AppEvent {
            cycle: self.cycle,
            call: Call::Receive(tx),
        };
        if self.events.send(event).await.is_err() {
            return Message::HttpDisconnect;
        }
        rx.await.unwrap_or(Message::HttpDisconnect)
    }
}

/// The application's `send` callable.
#[derive(Clone)]
pub struct Sender {
    cycle: CycleId,
    events: mpsc::Sender<AppEvent>,
}

impl Sender {
    /// Hand a message to the server. Resolves once the server has accepted
    /// it, which includes waiting out write backpressure.
    pub async fn send(&self, message: Message) -> Result<(), SendError> {
        let (tx, rx) = oneshot::channel();
        let event = AppEvent {
            cycle: self.cycle,
            call: Call::Send(message, tx),
        };
        if self.events.send(event).await.is_err() {
            return Ok(());
        }
        rx.await.unwrap_or(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::scope::{LifespanScope, ProtocolInfo};

    fn lifespan_scope() -> Scope {
        Scope::Lifespan(LifespanScope {
            protocol: ProtocolInfo::new(Interface::V3),
        })
    }

    async fn echo_version(scope: Scope, _receive: Receive, send: Sender) -> AppResult {
        let version = scope.protocol().version;
        send.send(Message::body(version.as_bytes().to_vec())).await?;
        Ok(())
    }

    async fn sent_body(app: &LoadedApp) -> Message {
        let (tx, mut rx) = mpsc::channel(4);
        let (receive, send) = handles(CycleId(1), tx);
        let task = tokio::spawn(app.call(lifespan_scope(), receive, send));
        let event = rx.recv().await.unwrap();
        let Call::Send(message, reply) = event.call else { panic!("expected send") };
        reply.send(Ok(())).unwrap();
        task.await.unwrap().unwrap();
        message
    }

    #[tokio::test]
    async fn three_arg_reports_v3() {
        let app = LoadedApp::new(echo_version);
        assert_eq!(app.interface(), Interface::V3);
        assert_eq!(sent_body(&app).await, Message::body(&b"3.0"[..]));
    }

    #[tokio::test]
    async fn two_arg_reports_v2() {
        let app = LoadedApp::from_factory(|scope: Scope| {
            move |receive: Receive, send: Sender| echo_version(scope, receive, send)
        });
        assert_eq!(app.interface(), Interface::V2);
        assert_eq!(sent_body(&app).await, Message::body(&b"2.0"[..]));
    }

    #[tokio::test]
    async fn interface_mode_overrides() {
        let app = LoadedApp::new(echo_version).with_interface_mode(InterfaceMode::V2);
        assert_eq!(sent_body(&app).await, Message::body(&b"2.0"[..]));
    }

    #[tokio::test]
    async fn closed_channel_means_disconnect() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let (receive, send) = handles(CycleId(7), tx);
        assert_eq!(receive.recv().await, Message::HttpDisconnect);
        assert!(send.send(Message::body(&b""[..])).await.is_ok());
    }

    #[test]
    fn panic_payloads_become_messages() {
        let outcome = Outcome::from_result(Err(Box::new("boom")));
        assert!(matches!(outcome, Outcome::Panicked(m) if m == "boom"));
        let outcome = Outcome::from_result(Ok(Err("bad".into())));
        assert!(matches!(outcome, Outcome::Failed(m) if m == "bad"));
    }
}
