//! portico: HTTP/1.x application server.
//!
//! Serves a small built-in application that echoes the request line back,
//! which is enough to exercise the server from curl or a load generator.

use std::path::PathBuf;
use std::process;

use clap::Parser;

use portico::app::{AppResult, LoadedApp, Receive, Sender};
use portico::config::{
    load_config, validate_config, InterfaceMode, LifespanMode, ParserKind, ServerConfig,
};
use portico::http::{Message, Scope};
use portico::lifecycle::signals::spawn_signal_handler;
use portico::observability::{logging, metrics};
use portico::Server;

#[derive(Debug, Parser)]
#[command(name = "portico", version, about = "HTTP/1.x application server")]
struct Cli {
    /// TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind host.
    #[arg(long)]
    host: Option<String>,

    /// Bind port.
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,

    /// Disable the access log.
    #[arg(long)]
    no_access_log: bool,

    /// Maximum concurrently running requests before answering 503.
    #[arg(long)]
    limit_concurrency: Option<usize>,

    /// Maximum open connections.
    #[arg(long)]
    limit_connections: Option<usize>,

    /// Shut down after serving this many requests.
    #[arg(long)]
    limit_max_requests: Option<u64>,

    /// Idle keep-alive timeout in seconds.
    #[arg(long)]
    timeout_keep_alive: Option<u64>,

    /// Seconds to wait for connections to drain on shutdown.
    #[arg(long)]
    timeout_graceful_shutdown: Option<u64>,

    /// Lifespan handshake mode.
    #[arg(long, value_parser = parse_lifespan)]
    lifespan: Option<LifespanMode>,

    /// Request parser backend.
    #[arg(long, value_parser = parse_parser)]
    http: Option<ParserKind>,

    /// Calling convention reported to the application.
    #[arg(long, value_parser = parse_interface)]
    interface: Option<InterfaceMode>,

    /// Mount point reported as `root_path`.
    #[arg(long)]
    root_path: Option<String>,
}

fn parse_lifespan(value: &str) -> Result<LifespanMode, String> {
    match value {
        "auto" => Ok(LifespanMode::Auto),
        "on" => Ok(LifespanMode::On),
        "off" => Ok(LifespanMode::Off),
        other => Err(format!("expected auto, on or off, got {other:?}")),
    }
}

fn parse_parser(value: &str) -> Result<ParserKind, String> {
    match value {
        "strict" => Ok(ParserKind::Strict),
        "lenient" => Ok(ParserKind::Lenient),
        other => Err(format!("expected strict or lenient, got {other:?}")),
    }
}

fn parse_interface(value: &str) -> Result<InterfaceMode, String> {
    match value {
        "auto" => Ok(InterfaceMode::Auto),
        "v3" => Ok(InterfaceMode::V3),
        "v2" => Ok(InterfaceMode::V2),
        other => Err(format!("expected auto, v3 or v2, got {other:?}")),
    }
}

impl Cli {
    fn apply(self, config: &mut ServerConfig) {
        if self.host.is_some() || self.port.is_some() {
            let (current_host, current_port) = config
                .listener
                .bind_address
                .rsplit_once(':')
                .map(|(h, p)| (h.to_string(), p.parse().unwrap_or(8000)))
                .unwrap_or_else(|| ("127.0.0.1".to_string(), 8000));
            let host = self.host.unwrap_or(current_host);
            let port = self.port.unwrap_or(current_port);
            config.listener.bind_address = if host.contains(':') && !host.starts_with('[') {
                format!("[{host}]:{port}")
            } else {
                format!("{host}:{port}")
            };
        }
        if let Some(level) = self.log_level {
            config.observability.log_level = level;
        }
        if self.no_access_log {
            config.observability.access_log = false;
        }
        if self.limit_concurrency.is_some() {
            config.limits.concurrency = self.limit_concurrency;
        }
        if self.limit_connections.is_some() {
            config.limits.max_connections = self.limit_connections;
        }
        if self.limit_max_requests.is_some() {
            config.limits.max_requests = self.limit_max_requests;
        }
        if let Some(secs) = self.timeout_keep_alive {
            config.timeouts.keep_alive_secs = secs;
        }
        if self.timeout_graceful_shutdown.is_some() {
            config.timeouts.graceful_shutdown_secs = self.timeout_graceful_shutdown;
        }
        if let Some(mode) = self.lifespan {
            config.lifespan.mode = mode;
        }
        if let Some(parser) = self.http {
            config.http.parser = parser;
        }
        if let Some(interface) = self.interface {
            config.http.interface = interface;
        }
        if let Some(root_path) = self.root_path {
            config.http.root_path = root_path;
        }
    }
}

/// Reads the whole request body, then answers with a one-line summary.
async fn demo_app(scope: Scope, receive: Receive, send: Sender) -> AppResult {
    let scope = match scope {
        Scope::Http(scope) => scope,
        Scope::Lifespan(_) => {
            loop {
                match receive.recv().await {
                    Message::LifespanStartup => {
                        send.send(Message::LifespanStartupComplete).await?
                    }
                    Message::LifespanShutdown => {
                        send.send(Message::LifespanShutdownComplete).await?;
                        return Ok(());
                    }
                    _ => return Ok(()),
                }
            }
        }
    };

    loop {
        match receive.recv().await {
            Message::HttpRequest { more_body: true, .. } => continue,
            Message::HttpRequest { .. } => break,
            _ => return Ok(()),
        }
    }

    let body = format!("Received {} request to {}", scope.method, scope.path);
    let length = body.len().to_string();
    send.send(Message::start(
        200,
        &[("content-type", "text/plain; charset=utf-8"), ("content-length", length.as_str())],
    ))
    .await?;
    send.send(Message::body(body)).await?;
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match load_config(path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("portico: {err}");
                process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };
    cli.apply(&mut config);
    if let Err(errors) = validate_config(&config) {
        for err in errors {
            eprintln!("portico: {err}");
        }
        process::exit(1);
    }

    logging::init(&config.observability.log_level);
    tracing::info!(
        bind_address = %config.listener.bind_address,
        concurrency = ?config.limits.concurrency,
        max_requests = ?config.limits.max_requests,
        keep_alive_secs = config.timeouts.keep_alive_secs,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                if let Err(err) = metrics::init_metrics(addr) {
                    tracing::error!(error = %err, "Failed to start metrics exporter");
                }
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let server = Server::new(config, LoadedApp::new(demo_app));
    spawn_signal_handler(server.shutdown_handle());

    if let Err(err) = server.run().await {
        tracing::error!(error = %err, "Server stopped");
        process::exit(err.exit_code());
    }
}
