//! Shared utilities for integration tests.
//!
//! [`MockTransport`] records everything the engine writes, and [`Harness`]
//! drives an [`HttpConnection`] the way the socket driver does, minus the
//! socket.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use portico::app::{AppEvent, AppResult, LoadedApp, Receive, Sender};
use portico::config::ServerConfig;
use portico::http::{HttpConnection, Message, Scope};
use portico::net::{ExtraInfo, ExtraInfoKey, Transport};
use portico::state::ServerState;
use portico::upgrade::UpgradeHandler;

pub const SIMPLE_GET: &[u8] = b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n";

/// How long the pump waits for an application event before giving up.
const PUMP_IDLE: Duration = Duration::from_millis(300);

/// Transport that keeps written bytes in memory.
pub struct MockTransport {
    buffer: Mutex<Vec<u8>>,
    closed: AtomicBool,
    read_paused: AtomicBool,
    write_buffer: AtomicUsize,
    client: SocketAddr,
    server: SocketAddr,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            read_paused: AtomicBool::new(false),
            write_buffer: AtomicUsize::new(0),
            client: "127.0.0.1:45678".parse().unwrap(),
            server: "127.0.0.1:8000".parse().unwrap(),
        })
    }

    /// Everything written so far.
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).into_owned()
    }

    /// Everything written so far, clearing the record.
    pub fn take(&self) -> String {
        let bytes = std::mem::take(&mut *self.buffer.lock().unwrap());
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Pretend this many bytes are still waiting to reach the socket.
    pub fn set_write_buffer_size(&self, size: usize) {
        self.write_buffer.store(size, Ordering::SeqCst);
    }
}

impl Transport for MockTransport {
    fn write(&self, data: Bytes) {
        if !self.is_closed() {
            self.buffer.lock().unwrap().extend_from_slice(&data);
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closing(&self) -> bool {
        self.is_closed()
    }

    fn pause_reading(&self) {
        self.read_paused.store(true, Ordering::SeqCst);
    }

    fn resume_reading(&self) {
        self.read_paused.store(false, Ordering::SeqCst);
    }

    fn is_reading_paused(&self) -> bool {
        self.read_paused.load(Ordering::SeqCst)
    }

    fn extra_info(&self, key: ExtraInfoKey) -> Option<ExtraInfo> {
        match key {
            ExtraInfoKey::Peername => Some(ExtraInfo::Address(self.client)),
            ExtraInfoKey::Sockname => Some(ExtraInfo::Address(self.server)),
            ExtraInfoKey::Tls => None,
        }
    }

    fn write_buffer_size(&self) -> usize {
        self.write_buffer.load(Ordering::SeqCst)
    }
}

/// Configuration with the clock- and host-dependent headers switched off,
/// so responses can be compared byte for byte.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.http.date_header = false;
    config.http.server_header = false;
    config
}

pub struct Harness {
    pub conn: HttpConnection,
    pub events: mpsc::Receiver<AppEvent>,
    pub transport: Arc<MockTransport>,
    pub state: Arc<ServerState>,
}

impl Harness {
    pub fn new(app: LoadedApp) -> Self {
        Self::with_config(test_config(), app)
    }

    pub fn with_config(config: ServerConfig, app: LoadedApp) -> Self {
        Self::build(config, app, None)
    }

    pub fn with_upgrade(app: LoadedApp, handler: Arc<dyn UpgradeHandler>) -> Self {
        Self::build(test_config(), app, Some(handler))
    }

    fn build(config: ServerConfig, app: LoadedApp, upgrade: Option<Arc<dyn UpgradeHandler>>) -> Self {
        let app = app.with_interface_mode(config.http.interface);
        let transport = MockTransport::new();
        let state = Arc::new(ServerState::new());
        let (conn, events) = HttpConnection::new(
            Arc::new(config),
            Arc::clone(&state),
            app,
            upgrade,
            Arc::clone(&transport) as Arc<dyn Transport>,
        );
        Self {
            conn,
            events,
            transport,
            state,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.conn.data_received(data);
    }

    /// Route application events into the engine until every application
    /// task has finished, or nothing happens for a while.
    pub async fn pump(&mut self) {
        loop {
            if !self.conn.has_running_tasks() {
                while let Ok(event) = self.events.try_recv() {
                    self.conn.handle_event(event);
                }
                if !self.conn.has_running_tasks() {
                    return;
                }
            }
            match tokio::time::timeout(PUMP_IDLE, self.events.recv()).await {
                Ok(Some(event)) => self.conn.handle_event(event),
                _ => return,
            }
        }
    }

    /// Feed bytes, then pump.
    pub async fn request(&mut self, data: &[u8]) -> String {
        self.feed(data);
        self.pump().await;
        self.transport.output()
    }
}

/// Answers every request with `Hello, world`.
pub async fn hello_world(_scope: Scope, _receive: Receive, send: Sender) -> AppResult {
    send.send(Message::start(
        200,
        &[("content-type", "text/plain"), ("content-length", "12")],
    ))
    .await?;
    send.send(Message::body(&b"Hello, world"[..])).await?;
    Ok(())
}

/// Reads the whole request body and sends it back.
pub async fn echo_body(_scope: Scope, receive: Receive, send: Sender) -> AppResult {
    let mut body = Vec::new();
    loop {
        match receive.recv().await {
            Message::HttpRequest { body: chunk, more_body } => {
                body.extend_from_slice(&chunk);
                if !more_body {
                    break;
                }
            }
            _ => return Ok(()),
        }
    }
    let length = body.len().to_string();
    send.send(Message::start(200, &[("content-length", length.as_str())])).await?;
    send.send(Message::body(body)).await?;
    Ok(())
}

/// Sends back the request path, with a content length.
pub async fn echo_path(scope: Scope, _receive: Receive, send: Sender) -> AppResult {
    let path = scope.as_http().map(|s| s.path.clone()).unwrap_or_default();
    let length = path.len().to_string();
    send.send(Message::start(200, &[("content-length", length.as_str())])).await?;
    send.send(Message::body(path)).await?;
    Ok(())
}
