//! Metrics collection and exposition.
//!
//! # Metrics
//! - `portico_requests_total` (counter): completed responses by method and status class
//! - `portico_connections_total` (counter): accepted connections
//! - `portico_rejected_total` (counter): requests/connections refused by a limit
//! - `portico_active_connections` (gauge): open connections
//! - `portico_active_requests` (gauge): application tasks in flight
//!
//! # Design Decisions
//! - Status codes are bucketed into classes to keep label cardinality low
//! - The Prometheus exporter is only installed when enabled in config

use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Install the Prometheus recorder with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn status_class(status: u16) -> &'static str {
    match status / 100 {
        1 => "1xx",
        2 => "2xx",
        3 => "3xx",
        4 => "4xx",
        5 => "5xx",
        _ => "other",
    }
}

pub fn record_request(method: &str, status: u16) {
    metrics::counter!(
        "portico_requests_total",
        "method" => method.to_string(),
        "status" => status_class(status)
    )
    .increment(1);
}

pub fn record_rejected(reason: &'static str) {
    metrics::counter!("portico_rejected_total", "reason" => reason).increment(1);
}

pub fn record_connection_opened(active: usize) {
    metrics::counter!("portico_connections_total").increment(1);
    metrics::gauge!("portico_active_connections").set(active as f64);
}

pub fn record_connection_closed(active: usize) {
    metrics::gauge!("portico_active_connections").set(active as f64);
}

pub fn record_active_requests(active: usize) {
    metrics::gauge!("portico_active_requests").set(active as f64);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classes() {
        assert_eq!(status_class(101), "1xx");
        assert_eq!(status_class(204), "2xx");
        assert_eq!(status_class(599), "5xx");
        assert_eq!(status_class(999), "other");
    }
}
