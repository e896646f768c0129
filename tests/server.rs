//! End-to-end tests over real sockets.

mod common;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use common::{echo_path, hello_world, test_config};
use portico::app::{AppError, AppResult, LoadedApp, Receive, Sender};
use portico::config::{LifespanMode, ServerConfig};
use portico::http::{Message, Scope};
use portico::lifecycle::{LifespanError, Shutdown};
use portico::net::Listener;
use portico::{Server, ServerError};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

struct Running {
    addr: SocketAddr,
    shutdown: Shutdown,
    state: std::sync::Arc<portico::state::ServerState>,
    task: JoinHandle<Result<(), ServerError>>,
}

fn start(mut config: ServerConfig, app: LoadedApp) -> Running {
    config.listener.bind_address = "127.0.0.1:0".to_string();
    let listener = Listener::bind(&config.listener).unwrap();
    let addr = listener.local_addr();
    let server = Server::new(config, app);
    let shutdown = server.shutdown_handle();
    let state = server.state();
    let task = tokio::spawn(server.serve(listener));
    Running {
        addr,
        shutdown,
        state,
        task,
    }
}

async fn finish(running: Running) -> Result<(), ServerError> {
    tokio::time::timeout(TEST_TIMEOUT, running.task)
        .await
        .expect("server did not stop")
        .unwrap()
}

/// Send raw bytes and read until the server closes.
async fn raw_exchange(addr: SocketAddr, request: &[u8]) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(request).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut response))
        .await
        .expect("server did not close")
        .unwrap();
    String::from_utf8_lossy(&response).into_owned()
}

#[tokio::test]
async fn serves_requests_over_tcp() {
    let running = start(test_config(), LoadedApp::new(hello_world));
    let client = reqwest::Client::new();

    for _ in 0..3 {
        let response = client
            .get(format!("http://{}/", running.addr))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "Hello, world");
    }
    assert_eq!(running.state.total_requests(), 3);

    running.shutdown.trigger();
    finish(running).await.unwrap();
}

#[tokio::test]
async fn paths_reach_the_application() {
    let running = start(test_config(), LoadedApp::new(echo_path));
    let response = reqwest::get(format!("http://{}/some/where?x=1", running.addr))
        .await
        .unwrap();
    assert_eq!(response.text().await.unwrap(), "/some/where");

    running.shutdown.trigger();
    finish(running).await.unwrap();
}

#[tokio::test]
async fn lifespan_wraps_serving() {
    let (tx, mut rx) = mpsc::unbounded_channel::<&'static str>();
    let app = LoadedApp::new(move |scope: Scope, receive: Receive, send: Sender| {
        let tx = tx.clone();
        async move {
            if scope.scope_type() == "http" {
                let _ = tx.send("request");
                return hello_world(scope, receive, send).await;
            }
            loop {
                match receive.recv().await {
                    Message::LifespanStartup => {
                        let _ = tx.send("startup");
                        send.send(Message::LifespanStartupComplete).await?;
                    }
                    Message::LifespanShutdown => {
                        let _ = tx.send("shutdown");
                        send.send(Message::LifespanShutdownComplete).await?;
                        return Ok::<(), AppError>(());
                    }
                    _ => return Ok(()),
                }
            }
        }
    });

    let mut config = test_config();
    config.lifespan.mode = LifespanMode::On;
    let running = start(config, app);
    let output = raw_exchange(
        running.addr,
        b"GET / HTTP/1.1\r\nHost: example.org\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert!(output.ends_with("Hello, world"));

    running.shutdown.trigger();
    finish(running).await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    assert_eq!(seen, ["startup", "request", "shutdown"]);
}

#[tokio::test]
async fn lifespan_startup_failure_stops_the_server() {
    async fn app(_scope: Scope, receive: Receive, send: Sender) -> AppResult {
        if receive.recv().await == Message::LifespanStartup {
            send.send(Message::LifespanStartupFailed {
                message: "missing credentials".to_string(),
            })
            .await?;
        }
        Ok(())
    }

    let running = start(test_config(), LoadedApp::new(app));
    let addr = running.addr;
    let err = finish(running).await.unwrap_err();

    assert_eq!(err.exit_code(), 3);
    assert!(matches!(
        err,
        ServerError::StartupFailed(LifespanError::StartupFailed(ref message)) if message == "missing credentials"
    ));
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn lifespan_shutdown_failure_is_reported() {
    async fn app(_scope: Scope, receive: Receive, send: Sender) -> AppResult {
        loop {
            match receive.recv().await {
                Message::LifespanStartup => send.send(Message::LifespanStartupComplete).await?,
                Message::LifespanShutdown => {
                    send.send(Message::LifespanShutdownFailed {
                        message: "flush failed".to_string(),
                    })
                    .await?;
                    return Ok(());
                }
                _ => return Ok(()),
            }
        }
    }

    let running = start(test_config(), LoadedApp::new(app));
    running.shutdown.trigger();
    let err = finish(running).await.unwrap_err();

    assert_eq!(err.exit_code(), 1);
    assert!(matches!(err, ServerError::ShutdownFailed(_)));
}

#[tokio::test]
async fn max_requests_stops_the_server() {
    let mut config = test_config();
    config.limits.max_requests = Some(2);
    let running = start(config, LoadedApp::new(hello_world));

    for _ in 0..2 {
        let output = raw_exchange(
            running.addr,
            b"GET / HTTP/1.1\r\nHost: example.org\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(output.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    finish(running).await.unwrap();
}

#[tokio::test]
async fn connection_limit_answers_503() {
    let mut config = test_config();
    config.limits.max_connections = Some(1);
    let running = start(config, LoadedApp::new(hello_world));

    let held = TcpStream::connect(running.addr).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, async {
        while running.state.active_connections() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    // Nothing is sent on the rejected socket: unread bytes would turn the
    // server's close into a reset.
    let output = raw_exchange(running.addr, b"").await;
    assert!(output.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

    drop(held);
    running.shutdown.trigger();
    finish(running).await.unwrap();
}

#[tokio::test]
async fn graceful_shutdown_timeout_cancels_stuck_connections() {
    async fn stuck(scope: Scope, _receive: Receive, _send: Sender) -> AppResult {
        if scope.scope_type() == "http" {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    let mut config = test_config();
    config.lifespan.mode = LifespanMode::Off;
    config.timeouts.graceful_shutdown_secs = Some(1);
    let running = start(config, LoadedApp::new(stuck));

    let mut stream = TcpStream::connect(running.addr).await.unwrap();
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: example.org\r\n\r\n")
        .await
        .unwrap();
    tokio::time::timeout(TEST_TIMEOUT, async {
        while running.state.active_requests() < 1 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    running.shutdown.trigger();
    finish(running).await.unwrap();
}
