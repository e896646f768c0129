//! Per-connection HTTP/1.x protocol engine.
//!
//! # Responsibilities
//! - Feed socket bytes to the parser and act on its events
//! - Sequence request/response cycles, one active at a time, pipelined
//!   requests queued in arrival order
//! - Run the application for each cycle and answer its `receive`/`send`
//!   calls
//! - Keep-alive deadline, read/write flow control, upgrade handoff
//!
//! # Design Decisions
//! - The engine performs no I/O of its own and never awaits: a driver
//!   feeds it socket events, application events and timer expiries, and it
//!   reacts synchronously through the [`Transport`]. Tests drive it the
//!   same way with a recording transport
//! - Application tasks talk to the engine only through [`AppEvent`]s on
//!   one bounded channel per connection; the tag on each event says which
//!   cycle it belongs to
//! - An application that ignores a disconnect and never returns is not
//!   cancelled; its task simply outlives the connection
//!
//! # Data Flow
//! ```text
//! data_received → parser → ParseEvent
//!     Head             → new Cycle (start now, or queue behind the active one)
//!     Body / Complete  → buffered in the Cycle the body belongs to
//! handle_event(AppEvent)
//!     Receive  → next http.request / http.disconnect (maybe 100 Continue first)
//!     Send     → Cycle frames → transport.write
//!     Finished → 500 / abort if the response was not completed
//! ```

use std::collections::{HashSet, VecDeque};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::app::{self, AppEvent, Call, CycleId, LoadedApp, Outcome};
use crate::config::ServerConfig;
use crate::http::cycle::{Cycle, RequestState, ResponseState, SendError};
use crate::http::message::Message;
use crate::http::parser::{ParseEvent, RequestHead, RequestParser};
use crate::http::response::{internal_server_error, service_unavailable, unsupported_upgrade, CONTINUE};
use crate::http::scope::{split_target, HttpScope, ProtocolInfo, Scope};
use crate::net::transport::Transport;
use crate::observability::logging::{APP_TARGET, ERROR_TARGET};
use crate::observability::{access, metrics};
use crate::state::ServerState;
use crate::upgrade::{UpgradeHandler, UpgradeHandoff, UpgradedProtocol};

/// Buffered request body above which reads pause.
pub const HIGH_WATER: usize = 64 * 1024;
/// Buffered request body at or below which paused reads resume.
pub const LOW_WATER: usize = 16 * 1024;
/// Capacity of the per-connection application event channel.
pub const EVENT_CAPACITY: usize = 64;

/// Coarse connection state, derived from the engine's bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    /// No request in progress.
    Idle,
    /// A cycle is active and the parser is waiting for the next head.
    ReadingHead,
    ReadingBody,
    Upgrading,
    Closing,
    Closed,
}

pub struct HttpConnection {
    config: Arc<ServerConfig>,
    state: Arc<ServerState>,
    app: LoadedApp,
    upgrade: Option<Arc<dyn UpgradeHandler>>,
    transport: Arc<dyn Transport>,
    parser: Box<dyn RequestParser>,
    events: mpsc::Sender<AppEvent>,
    client: Option<SocketAddr>,
    server: Option<SocketAddr>,
    scheme: &'static str,
    current: Option<Cycle>,
    pipeline: VecDeque<Cycle>,
    /// Cycle the parser is currently delivering body bytes to.
    reading: Option<CycleId>,
    /// Application tasks that have not reported back yet.
    tasks: HashSet<CycleId>,
    next_cycle: u64,
    keep_alive_deadline: Option<Instant>,
    shutting_down: bool,
    lost: bool,
    writing_paused: bool,
    blocked_sends: Vec<oneshot::Sender<Result<(), SendError>>>,
    upgraded: Option<Box<dyn UpgradedProtocol>>,
}

impl HttpConnection {
    /// Create the engine for a freshly accepted transport. The receiver
    /// carries application events that must be passed back through
    /// [`HttpConnection::handle_event`].
    pub fn new(
        config: Arc<ServerConfig>,
        state: Arc<ServerState>,
        app: LoadedApp,
        upgrade: Option<Arc<dyn UpgradeHandler>>,
        transport: Arc<dyn Transport>,
    ) -> (Self, mpsc::Receiver<AppEvent>) {
        let (events, rx) = mpsc::channel(EVENT_CAPACITY);
        let parser = config.http.parser.build(config.limits.max_head_size);
        let client = transport.peername();
        let server = transport.sockname();
        let scheme = if transport.is_tls() { "https" } else { "http" };
        tracing::trace!(target: ERROR_TARGET, client = ?client, "HTTP connection made");

        let conn = Self {
            config,
            state,
            app,
            upgrade,
            transport,
            parser,
            events,
            client,
            server,
            scheme,
            current: None,
            pipeline: VecDeque::new(),
            reading: None,
            tasks: HashSet::new(),
            next_cycle: 1,
            keep_alive_deadline: None,
            shutting_down: false,
            lost: false,
            writing_paused: false,
            blocked_sends: Vec::new(),
            upgraded: None,
        };
        (conn, rx)
    }

    pub fn data_received(&mut self, data: &[u8]) {
        if let Some(protocol) = self.upgraded.as_mut() {
            protocol.data_received(data);
            return;
        }
        if self.lost || self.transport.is_closing() {
            return;
        }
        self.keep_alive_deadline = None;

        let mut events = Vec::new();
        let result = self.parser.feed(data, &mut events);
        for event in events {
            if self.transport.is_closing() || self.upgraded.is_some() {
                break;
            }
            self.on_parse_event(event);
        }
        if let Err(err) = result {
            tracing::warn!(target: ERROR_TARGET, "Invalid HTTP request received.");
            tracing::debug!(target: ERROR_TARGET, error = %err, client = ?self.client, "Parse error");
            self.transport.close();
        }
        if self.current.is_none() && self.pipeline.is_empty() {
            self.rearm_idle_deadline();
        }
        self.update_read_pause();
    }

    /// The peer went away (EOF or socket error).
    pub fn connection_lost(&mut self) {
        if self.lost {
            return;
        }
        self.lost = true;
        tracing::trace!(target: ERROR_TARGET, client = ?self.client, "HTTP connection lost");
        if let Some(protocol) = self.upgraded.as_mut() {
            protocol.connection_lost();
        }
        if let Some(cycle) = self.current.as_mut() {
            cycle.disconnect();
            if let Some(reply) = cycle.pending_receive.take() {
                let _ = reply.send(Message::HttpDisconnect);
            }
        }
        self.pipeline.clear();
        self.keep_alive_deadline = None;
        for reply in self.blocked_sends.drain(..) {
            let _ = reply.send(Ok(()));
        }
        self.transport.close();
    }

    /// Stop taking requests: close now if idle, otherwise once the active
    /// response completes.
    pub fn shutdown(&mut self) {
        self.shutting_down = true;
        if self.upgraded.is_none() && self.current.is_none() {
            self.transport.close();
        }
    }

    pub fn keep_alive_deadline(&self) -> Option<Instant> {
        self.keep_alive_deadline
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.keep_alive_deadline.is_some_and(|deadline| now >= deadline)
    }

    /// Close the connection if its idle deadline has passed.
    pub fn on_keep_alive_timeout(&mut self, now: Instant) {
        if self.is_expired(now) {
            self.keep_alive_deadline = None;
            tracing::debug!(target: ERROR_TARGET, client = ?self.client, "Closing idle connection");
            self.transport.close();
        }
    }

    pub fn handle_event(&mut self, event: AppEvent) {
        let AppEvent { cycle, call } = event;
        match call {
            Call::Receive(reply) => self.on_receive(cycle, reply),
            Call::Send(message, reply) => self.on_send(cycle, message, reply),
            Call::Finished(outcome) => self.on_finished(cycle, outcome),
        }
        self.update_read_pause();
    }

    /// Hold back `send` completions until [`HttpConnection::resume_writing`].
    pub fn pause_writing(&mut self) {
        self.writing_paused = true;
    }

    pub fn resume_writing(&mut self) {
        self.writing_paused = false;
        for reply in self.blocked_sends.drain(..) {
            let _ = reply.send(Ok(()));
        }
    }

    pub fn is_writing_paused(&self) -> bool {
        self.writing_paused
    }

    pub fn has_running_tasks(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Requests parsed but waiting behind the active one.
    pub fn pipeline_depth(&self) -> usize {
        self.pipeline.len()
    }

    pub fn phase(&self) -> ConnectionPhase {
        if self.lost {
            ConnectionPhase::Closed
        } else if self.upgraded.is_some() {
            ConnectionPhase::Upgrading
        } else if self.transport.is_closing() {
            ConnectionPhase::Closing
        } else if self
            .reading_cycle()
            .is_some_and(|cycle| cycle.request == RequestState::AwaitingBody)
        {
            ConnectionPhase::ReadingBody
        } else if self.current.is_none() && self.pipeline.is_empty() {
            ConnectionPhase::Idle
        } else {
            ConnectionPhase::ReadingHead
        }
    }

    fn on_parse_event(&mut self, event: ParseEvent) {
        match event {
            ParseEvent::Head(head) => self.on_head(head),
            ParseEvent::Body(chunk) => {
                if let Some(cycle) = self.reading_cycle_mut() {
                    cycle.push_body(&chunk);
                }
                self.deliver();
            }
            ParseEvent::MessageComplete => {
                if let Some(cycle) = self.reading_cycle_mut() {
                    cycle.finish_body();
                }
                self.deliver();
            }
        }
    }

    fn on_head(&mut self, head: RequestHead) {
        let scope = self.build_scope(&head);
        if let Some(protocol) = &head.upgrade {
            self.on_upgrade(protocol, scope);
            return;
        }

        let id = CycleId(self.next_cycle);
        self.next_cycle += 1;
        self.reading = Some(id);
        let cycle = Cycle::new(id, &head, Scope::Http(scope));
        if self.current.is_none() {
            self.start_cycle(cycle);
        } else {
            self.pipeline.push_back(cycle);
        }
    }

    fn build_scope(&self, head: &RequestHead) -> HttpScope {
        let (path, raw_path, query_string) = split_target(&head.target);
        HttpScope {
            protocol: ProtocolInfo::new(self.app.interface()),
            http_version: head.version,
            method: head.method.clone(),
            scheme: self.scheme,
            path,
            raw_path,
            query_string,
            root_path: self.config.http.root_path.clone(),
            headers: head.headers.clone(),
            client: self.client,
            server: self.server,
        }
    }

    fn on_upgrade(&mut self, protocol: &str, scope: HttpScope) {
        let handler = self
            .upgrade
            .as_ref()
            .filter(|handler| handler.protocol().eq_ignore_ascii_case(protocol))
            .cloned();
        let Some(handler) = handler else {
            tracing::warn!(target: ERROR_TARGET, protocol, "Unsupported upgrade request.");
            self.write_canned(unsupported_upgrade);
            self.transport.close();
            return;
        };

        tracing::trace!(target: ERROR_TARGET, protocol, "Upgrading to {}", protocol);
        self.keep_alive_deadline = None;
        let handoff = UpgradeHandoff {
            transport: Arc::clone(&self.transport),
            scope,
            buffered: self.parser.take_unconsumed(),
        };
        self.upgraded = Some(handler.upgrade(handoff));
    }

    fn start_cycle(&mut self, mut cycle: Cycle) {
        if self.shutting_down {
            cycle.keep_alive = false;
        }
        if self.state.at_request_limit(self.config.limits.concurrency) {
            tracing::warn!(target: ERROR_TARGET, "Exceeded concurrency limit.");
            metrics::record_rejected("concurrency");
            self.write_canned(service_unavailable);
            self.log_response(&cycle, 503);
            cycle.response = ResponseState::Failed;
            cycle.disconnect();
            self.current = Some(cycle);
            self.transport.close();
            return;
        }

        let Some(scope) = cycle.scope.take() else {
            return;
        };
        tracing::trace!(target: APP_TARGET, cycle = %cycle.id, "Started scope");
        let guard = self.state.track_request();
        let (receive, send) = app::handles(cycle.id, self.events.clone());
        let call = self.app.call(scope, receive, send);
        let events = self.events.clone();
        let id = cycle.id;
        tokio::spawn(async move {
            let result = AssertUnwindSafe(call).catch_unwind().await;
            drop(guard);
            let _ = events.send(AppEvent::finished(id, Outcome::from_result(result))).await;
        });
        self.tasks.insert(id);
        self.current = Some(cycle);
        self.deliver();
    }

    fn on_receive(&mut self, id: CycleId, reply: oneshot::Sender<Message>) {
        let Some(cycle) = self.current.as_mut().filter(|cycle| cycle.id == id) else {
            let _ = reply.send(Message::HttpDisconnect);
            return;
        };
        if cycle.take_continue() && !self.transport.is_closing() {
            self.transport.write(Bytes::from_static(CONTINUE));
        }
        cycle.pending_receive = Some(reply);
        self.deliver();
    }

    /// Answer a waiting `receive` if the active cycle has something for it.
    fn deliver(&mut self) {
        let Some(cycle) = self.current.as_mut() else {
            return;
        };
        if cycle.pending_receive.is_none() {
            return;
        }
        if let Some(message) = cycle.next_message() {
            tracing::trace!(target: APP_TARGET, cycle = %cycle.id, "Receive {}", message.summary());
            if let Some(reply) = cycle.pending_receive.take() {
                let _ = reply.send(message);
            }
        }
    }

    fn on_send(&mut self, id: CycleId, message: Message, reply: oneshot::Sender<Result<(), SendError>>) {
        tracing::trace!(target: APP_TARGET, cycle = %id, "Send {}", message.summary());
        if self.lost || self.transport.is_closing() {
            let _ = reply.send(Ok(()));
            return;
        }
        if !self.current.as_ref().is_some_and(|cycle| cycle.id == id) {
            let err = SendError::AlreadyCompleted;
            tracing::error!(target: ERROR_TARGET, cycle = %id, error = %err, "Unexpected message after response completed");
            self.transport.close();
            let _ = reply.send(Err(err));
            return;
        }

        match self.process_send(message) {
            Ok(()) if self.writing_paused => self.blocked_sends.push(reply),
            Ok(()) => {
                let _ = reply.send(Ok(()));
            }
            Err(err) => {
                tracing::error!(target: ERROR_TARGET, cycle = %id, error = %err, "Invalid response from application");
                self.abort_current();
                let _ = reply.send(Err(err));
            }
        }
    }

    fn process_send(&mut self, message: Message) -> Result<(), SendError> {
        let complete = match message {
            Message::ResponseStart { status, headers } => {
                let defaults = self.state.default_headers(&self.config.http);
                let Some(cycle) = self.current.as_mut() else {
                    return Ok(());
                };
                let head = cycle.start_response(status, &headers, &defaults)?;
                self.transport.write(head);
                false
            }
            Message::ResponseBody { body, more_body } => {
                let Some(cycle) = self.current.as_mut() else {
                    return Ok(());
                };
                for frame in cycle.write_body(body, more_body)? {
                    self.transport.write(frame);
                }
                cycle.response == ResponseState::Complete
            }
            other => {
                let started = self
                    .current
                    .as_ref()
                    .is_some_and(|cycle| cycle.response != ResponseState::NotStarted);
                return Err(SendError::UnexpectedMessage {
                    expected: if started { "http.response.body" } else { "http.response.start" },
                    received: other.message_type(),
                });
            }
        };

        if self.transport.write_buffer_size() > HIGH_WATER {
            self.pause_writing();
        }
        if complete {
            self.on_response_complete();
        }
        Ok(())
    }

    fn on_response_complete(&mut self) {
        let Some(mut cycle) = self.current.take() else {
            return;
        };
        if let Some(status) = cycle.status {
            self.log_response(&cycle, status);
        }
        if let Some(reply) = cycle.pending_receive.take() {
            let _ = reply.send(Message::HttpDisconnect);
        }

        if !cycle.keep_alive || self.shutting_down {
            self.transport.close();
            return;
        }
        match self.pipeline.pop_front() {
            Some(next) => self.start_cycle(next),
            None => self.arm_keep_alive(),
        }
    }

    fn on_finished(&mut self, id: CycleId, outcome: Outcome) {
        self.tasks.remove(&id);
        let pending = self
            .current
            .as_ref()
            .filter(|cycle| cycle.id == id && !cycle.is_response_done())
            .map(|cycle| cycle.response);

        match outcome {
            Outcome::Returned => {
                tracing::trace!(target: APP_TARGET, cycle = %id, "Completed");
                match pending {
                    Some(ResponseState::NotStarted) => {
                        tracing::error!(target: ERROR_TARGET, cycle = %id, "Application returned without starting response.");
                    }
                    Some(_) => {
                        tracing::error!(target: ERROR_TARGET, cycle = %id, "Application returned without completing response.");
                    }
                    None => return,
                }
            }
            Outcome::Failed(err) | Outcome::Panicked(err) => {
                tracing::trace!(target: APP_TARGET, cycle = %id, "Raised exception");
                tracing::error!(target: ERROR_TARGET, cycle = %id, error = %err, "Exception in application");
                if pending.is_none() {
                    self.close_after_failure(id);
                    return;
                }
            }
        }
        self.abort_current();
    }

    /// Fail the active cycle: a 500 if nothing of the response reached the
    /// wire, then close either way.
    fn abort_current(&mut self) {
        let Some(mut cycle) = self.current.take() else {
            return;
        };
        let nothing_written = cycle.response == ResponseState::NotStarted;
        cycle.response = ResponseState::Failed;
        cycle.keep_alive = false;
        if let Some(reply) = cycle.pending_receive.take() {
            let _ = reply.send(Message::HttpDisconnect);
        }
        if nothing_written && !self.transport.is_closing() {
            self.write_canned(internal_server_error);
            self.log_response(&cycle, 500);
        }
        self.current = Some(cycle);
        self.transport.close();
    }

    /// A task failed after its own response finished. Close once whatever
    /// response is in flight completes, or now if there is none.
    fn close_after_failure(&mut self, id: CycleId) {
        match self.current.as_mut() {
            Some(cycle) if cycle.id != id => {
                cycle.keep_alive = false;
            }
            Some(_) => {}
            None => {
                self.keep_alive_deadline = None;
                self.transport.close();
            }
        }
    }

    /// Idle reads (trailing body of a finished request, a partial head)
    /// keep the connection on an idle deadline.
    fn rearm_idle_deadline(&mut self) {
        if self.lost || self.upgraded.is_some() || self.transport.is_closing() {
            return;
        }
        let timeout = self.config.timeouts.keep_alive();
        if !timeout.is_zero() {
            self.keep_alive_deadline = Some(Instant::now() + timeout);
        }
    }

    fn arm_keep_alive(&mut self) {
        let timeout = self.config.timeouts.keep_alive();
        if timeout.is_zero() {
            self.transport.close();
        } else {
            self.keep_alive_deadline = Some(Instant::now() + timeout);
        }
    }

    fn reading_cycle(&self) -> Option<&Cycle> {
        let id = self.reading?;
        self.current
            .iter()
            .chain(self.pipeline.iter())
            .find(|cycle| cycle.id == id)
    }

    fn reading_cycle_mut(&mut self) -> Option<&mut Cycle> {
        let id = self.reading?;
        self.current
            .iter_mut()
            .chain(self.pipeline.iter_mut())
            .find(|cycle| cycle.id == id)
    }

    fn update_read_pause(&self) {
        if self.lost || self.upgraded.is_some() || self.transport.is_closing() {
            return;
        }
        let buffered = self.reading_cycle().map_or(0, Cycle::buffered);
        let pipeline_full = self.pipeline.len() >= self.config.limits.max_pipeline_depth;
        if self.transport.is_reading_paused() {
            if buffered <= LOW_WATER && !pipeline_full {
                self.transport.resume_reading();
            }
        } else if buffered > HIGH_WATER || pipeline_full {
            self.transport.pause_reading();
        }
    }

    fn write_canned(&self, build: fn(&[(&[u8], &[u8])]) -> Bytes) {
        let defaults = self.state.default_headers(&self.config.http);
        let pairs: Vec<(&[u8], &[u8])> = defaults.iter().map(|(n, v)| (&n[..], &v[..])).collect();
        self.transport.write(build(&pairs));
    }

    fn log_response(&self, cycle: &Cycle, status: u16) {
        metrics::record_request(&cycle.method, status);
        if self.config.observability.access_log {
            access::log_response(self.client, &cycle.request_line(), status);
        }
    }
}

impl std::fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnection")
            .field("client", &self.client)
            .field("phase", &self.phase())
            .field("pipeline", &self.pipeline.len())
            .field("tasks", &self.tasks.len())
            .finish()
    }
}
