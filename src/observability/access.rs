//! Access log lines.

use std::net::SocketAddr;

use crate::observability::logging::ACCESS_TARGET;

/// `127.0.0.1:50312 - "GET /path?x=1 HTTP/1.1" 200`
pub fn format_line(client: Option<SocketAddr>, request_line: &str, status: u16) -> String {
    let client = client.map_or_else(|| "-".to_string(), |addr| addr.to_string());
    format!("{client} - \"{request_line}\" {status}")
}

pub fn log_response(client: Option<SocketAddr>, request_line: &str, status: u16) {
    tracing::info!(
        target: ACCESS_TARGET,
        status,
        "{}",
        format_line(client, request_line, status)
    );
}
