//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration for the application server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listener configuration (bind address, backlog).
    pub listener: ListenerConfig,

    /// Concurrency and size limits.
    pub limits: LimitsConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// HTTP protocol behaviour.
    pub http: HttpConfig,

    /// Lifespan handshake settings.
    pub lifespan: LifespanConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "127.0.0.1:8000").
    pub bind_address: String,

    /// Listen backlog passed to the OS.
    pub backlog: u32,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8000".to_string(),
            backlog: 2048,
        }
    }
}

/// Concurrency and size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrently running requests before answering 503.
    pub concurrency: Option<usize>,

    /// Maximum open connections, checked at accept time.
    pub max_connections: Option<usize>,

    /// Begin graceful shutdown after this many requests.
    pub max_requests: Option<u64>,

    /// Largest incomplete request head the parser will buffer, in bytes.
    pub max_head_size: usize,

    /// Pipelined requests queued behind the active one before reads pause.
    pub max_pipeline_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            max_connections: None,
            max_requests: None,
            max_head_size: 16 * 1024,
            max_pipeline_depth: 16,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Idle keep-alive timeout in seconds. Zero closes after every response.
    pub keep_alive_secs: u64,

    /// How long to wait for open connections during shutdown.
    pub graceful_shutdown_secs: Option<u64>,

    /// How long to wait for a lifespan reply.
    pub lifespan_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            keep_alive_secs: 5,
            graceful_shutdown_secs: None,
            lifespan_secs: 60,
        }
    }
}

impl TimeoutConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn graceful_shutdown(&self) -> Option<Duration> {
        self.graceful_shutdown_secs.map(Duration::from_secs)
    }

    pub fn lifespan(&self) -> Duration {
        Duration::from_secs(self.lifespan_secs)
    }
}

/// Which request parser backend a connection uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    /// Reject anything outside RFC 9112 request syntax.
    #[default]
    Strict,
    /// Tolerate whitespace quirks and obsolete line folding in headers.
    Lenient,
}

/// How the application's calling convention is reported in the scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceMode {
    /// Use whatever convention the loaded application implements.
    #[default]
    Auto,
    V3,
    V2,
}

/// HTTP protocol behaviour.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Parser backend.
    pub parser: ParserKind,

    /// Calling convention reporting.
    pub interface: InterfaceMode,

    /// Mount point reported to the application as `root_path`.
    pub root_path: String,

    /// Emit a `server` header on every response.
    pub server_header: bool,

    /// Emit a `date` header on every response.
    pub date_header: bool,

    /// Value of the `server` header.
    pub server_name: String,

    /// Extra headers added to every response.
    pub headers: Vec<(String, String)>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            parser: ParserKind::Strict,
            interface: InterfaceMode::Auto,
            root_path: String::new(),
            server_header: true,
            date_header: true,
            server_name: "portico".to_string(),
            headers: Vec::new(),
        }
    }
}

/// Whether the lifespan handshake runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifespanMode {
    /// Run it, but treat an application that does not speak it as success.
    #[default]
    Auto,
    /// Run it; an application error is a startup failure.
    On,
    /// Skip it.
    Off,
}

/// Lifespan handshake settings.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct LifespanConfig {
    pub mode: LifespanMode,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit one access log line per response.
    pub access_log: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            access_log: true,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ServerConfig::default();
        assert_eq!(config.listener.bind_address, "127.0.0.1:8000");
        assert_eq!(config.timeouts.keep_alive(), Duration::from_secs(5));
        assert_eq!(config.limits.max_head_size, 16 * 1024);
        assert_eq!(config.http.parser, ParserKind::Strict);
        assert_eq!(config.lifespan.mode, LifespanMode::Auto);
        assert!(config.limits.concurrency.is_none());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ServerConfig = toml::from_str(
            r#"
            [limits]
            concurrency = 4

            [http]
            parser = "lenient"
            root_path = "/app"

            [lifespan]
            mode = "off"
            "#,
        )
        .unwrap();

        assert_eq!(config.limits.concurrency, Some(4));
        assert_eq!(config.limits.max_pipeline_depth, 16);
        assert_eq!(config.http.parser, ParserKind::Lenient);
        assert_eq!(config.http.root_path, "/app");
        assert!(config.http.server_header);
        assert_eq!(config.lifespan.mode, LifespanMode::Off);
    }
}
