//! Per-socket driver task.
//!
//! Owns the read half of a socket and the engine for it, and multiplexes
//! everything that can happen to a connection onto the engine's
//! synchronous entry points: bytes read, application events, the
//! keep-alive deadline, write drain, and server shutdown.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};

use crate::app::LoadedApp;
use crate::config::ServerConfig;
use crate::http::engine::HttpConnection;
use crate::net::transport::{StreamTransport, Transport};
use crate::state::ServerState;
use crate::upgrade::UpgradeHandler;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Everything a connection needs from the server, cheap to clone per accept.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: Arc<ServerConfig>,
    pub state: Arc<ServerState>,
    pub app: LoadedApp,
    pub upgrade: Option<Arc<dyn UpgradeHandler>>,
}

/// Serve one connection until it closes.
pub async fn serve_connection<S>(
    stream: S,
    local: Option<SocketAddr>,
    peer: Option<SocketAddr>,
    ctx: ConnectionContext,
    mut shutdown: broadcast::Receiver<()>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (transport, writer_task) = StreamTransport::spawn(writer, local, peer);
    let (mut conn, mut events) = HttpConnection::new(
        ctx.config,
        ctx.state,
        ctx.app,
        ctx.upgrade,
        Arc::clone(&transport) as Arc<dyn Transport>,
    );

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    let mut shutdown_seen = false;
    while !transport.is_closing() {
        let deadline = conn.keep_alive_deadline();
        let reading = !transport.is_reading_paused();
        let draining = conn.is_writing_paused();

        tokio::select! {
            _ = shutdown.recv(), if !shutdown_seen => {
                shutdown_seen = true;
                conn.shutdown();
            }
            Some(event) = events.recv() => conn.handle_event(event),
            read = reader.read(&mut buf), if reading => match read {
                Ok(0) => break,
                Ok(n) => conn.data_received(&buf[..n]),
                Err(err) => {
                    tracing::debug!(peer = ?peer, error = %err, "Socket read failed");
                    break;
                }
            },
            _ = transport.wait_drained(), if draining => conn.resume_writing(),
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                conn.on_keep_alive_timeout(Instant::now());
            }
        }
    }

    conn.connection_lost();
    drop(conn);
    let _ = writer_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::message::Message;
    use crate::app::{AppResult, Receive, Sender};
    use crate::http::scope::Scope;
    use tokio::io::AsyncWriteExt;

    async fn hello(_scope: Scope, _receive: Receive, send: Sender) -> AppResult {
        send.send(Message::start(200, &[("content-length", "5")])).await?;
        send.send(Message::body(&b"hello"[..])).await?;
        Ok(())
    }

    #[tokio::test]
    async fn serves_a_request_over_a_duplex_stream() {
        let (mut client, server) = tokio::io::duplex(4096);
        let mut config = ServerConfig::default();
        config.timeouts.keep_alive_secs = 0;
        let ctx = ConnectionContext {
            config: Arc::new(config),
            state: Arc::new(ServerState::new()),
            app: LoadedApp::new(hello),
            upgrade: None,
        };
        let (_tx, rx) = broadcast::channel(1);
        let task = tokio::spawn(serve_connection(server, None, None, ctx, rx));

        client.write_all(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n").await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("\r\n\r\nhello"));
        task.await.unwrap();
    }
}
