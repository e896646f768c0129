//! Transport capability and its stream-backed implementation.
//!
//! # Responsibilities
//! - Define what the connection engine may do to a socket
//! - Implement it over any `AsyncWrite` half with a dedicated writer task
//!
//! # Design Decisions
//! - Every operation is synchronous and non-blocking: writes are queued to
//!   the writer task and the queued byte count is the backpressure signal
//! - `close` is ordered after queued writes, so a final response is always
//!   flushed before the socket shuts down
//! - Read pausing is only a flag; the driver that owns the read half
//!   honours it

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

/// Keys for [`Transport::extra_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtraInfoKey {
    Sockname,
    Peername,
    Tls,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtraInfo {
    Address(SocketAddr),
    /// Negotiated TLS parameters of an encrypted transport.
    Tls { version: String },
}

/// A byte-stream socket as seen by the connection engine.
pub trait Transport: Send + Sync {
    /// Queue bytes for writing. Ignored once the transport is closing.
    fn write(&self, data: Bytes);

    /// Close after everything queued so far has been written.
    fn close(&self);

    fn is_closing(&self) -> bool;

    fn pause_reading(&self);

    fn resume_reading(&self);

    fn is_reading_paused(&self) -> bool;

    fn extra_info(&self, key: ExtraInfoKey) -> Option<ExtraInfo>;

    /// Bytes queued but not yet written to the socket.
    fn write_buffer_size(&self) -> usize;
}

impl dyn Transport {
    pub fn sockname(&self) -> Option<SocketAddr> {
        match self.extra_info(ExtraInfoKey::Sockname) {
            Some(ExtraInfo::Address(addr)) => Some(addr),
            _ => None,
        }
    }

    pub fn peername(&self) -> Option<SocketAddr> {
        match self.extra_info(ExtraInfoKey::Peername) {
            Some(ExtraInfo::Address(addr)) => Some(addr),
            _ => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        self.extra_info(ExtraInfoKey::Tls).is_some()
    }
}

enum Command {
    Write(Bytes),
    Close,
}

#[derive(Debug, Default)]
struct Shared {
    pending: AtomicUsize,
    closing: AtomicBool,
    drained: Notify,
}

impl Shared {
    fn release(&self, len: usize) {
        if self.pending.fetch_sub(len, Ordering::SeqCst) == len {
            self.drained.notify_waiters();
        }
    }
}

/// [`Transport`] over the write half of a stream.
pub struct StreamTransport {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    read_paused: AtomicBool,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
}

impl StreamTransport {
    /// Start the writer task for `writer`. The returned handle finishes once
    /// the transport is closed and all queued bytes are written.
    pub fn spawn<W>(
        writer: W,
        local: Option<SocketAddr>,
        peer: Option<SocketAddr>,
    ) -> (Arc<Self>, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (commands, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        let task = tokio::spawn(write_loop(writer, rx, Arc::clone(&shared)));
        let transport = Arc::new(Self {
            commands,
            shared,
            read_paused: AtomicBool::new(false),
            local,
            peer,
        });
        (transport, task)
    }

    /// Resolves once every queued byte has reached the socket (or the
    /// socket failed).
    pub async fn wait_drained(&self) {
        loop {
            let drained = self.shared.drained.notified();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            drained.await;
        }
    }
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Command>, shared: Arc<Shared>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            Command::Write(data) => {
                let len = data.len();
                if let Err(err) = writer.write_all(&data).await {
                    tracing::debug!(error = %err, "Socket write failed");
                    shared.closing.store(true, Ordering::SeqCst);
                    shared.pending.store(0, Ordering::SeqCst);
                    shared.drained.notify_waiters();
                    return;
                }
                shared.release(len);
            }
            Command::Close => break,
        }
    }
    let _ = writer.flush().await;
    let _ = writer.shutdown().await;
}

impl Transport for StreamTransport {
    fn write(&self, data: Bytes) {
        if data.is_empty() || self.is_closing() {
            return;
        }
        self.shared.pending.fetch_add(data.len(), Ordering::SeqCst);
        let len = data.len();
        if self.commands.send(Command::Write(data)).is_err() {
            self.shared.release(len);
        }
    }

    fn close(&self) {
        if !self.shared.closing.swap(true, Ordering::SeqCst) {
            let _ = self.commands.send(Command::Close);
        }
    }

    fn is_closing(&self) -> bool {
        self.shared.closing.load(Ordering::SeqCst)
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
            ExtraInfoKey::Sockname => self.local.map(ExtraInfo::Address),
            ExtraInfoKey::Peername => self.peer.map(ExtraInfo::Address),
            ExtraInfoKey::Tls => None,
        }
    }

    fn write_buffer_size(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn writes_then_closes_in_order() {
        let (client, server) = tokio::io::duplex(64);
        let (_read, write) = tokio::io::split(server);
        let (transport, task) = StreamTransport::spawn(write, None, None);

        transport.write(Bytes::from_static(b"hello "));
        transport.write(Bytes::from_static(b"world"));
        transport.close();
        assert!(transport.is_closing());
        transport.write(Bytes::from_static(b"ignored"));

        let mut client = client;
        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"hello world");
        task.await.unwrap();
        transport.wait_drained().await;
        assert_eq!(transport.write_buffer_size(), 0);
    }

    #[tokio::test]
    async fn read_pause_flag() {
        let (_client, server) = tokio::io::duplex(64);
        let addr: SocketAddr = "127.0.0.1:8000".parse().unwrap();
        let (transport, _task) = StreamTransport::spawn(server, Some(addr), None);
        transport.pause_reading();
        assert!(transport.is_reading_paused());
        transport.resume_reading();
        assert!(!transport.is_reading_paused());

        let transport: Arc<dyn Transport> = transport;
        assert_eq!(transport.sockname(), Some(addr));
        assert_eq!(transport.peername(), None);
        assert!(!transport.is_tls());
    }
}
