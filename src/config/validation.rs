//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (limits > 0, addresses parse)
//! - Reject default headers that could corrupt the response head
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;

use crate::config::schema::ServerConfig;
use crate::http::response::{is_valid_header_name, is_valid_header_value};

const MIN_HEAD_SIZE: usize = 1024;
const MAX_KEEP_ALIVE_SECS: u64 = 3600;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid {field} address {value:?}")]
    InvalidAddress { field: &'static str, value: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("limits.max_head_size must be at least 1024 bytes, got {0}")]
    HeadSizeTooSmall(usize),

    #[error("timeouts.keep_alive_secs must be at most 3600, got {0}")]
    KeepAliveTooLong(u64),

    #[error("invalid default header {0:?}")]
    InvalidHeader(String),

    #[error("http.root_path must be empty or start with '/', got {0:?}")]
    InvalidRootPath(String),
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "listener.bind_address",
            value: config.listener.bind_address.clone(),
        });
    }
    if config.listener.backlog == 0 {
        errors.push(ValidationError::Zero("listener.backlog"));
    }

    let limits = &config.limits;
    if limits.concurrency == Some(0) {
        errors.push(ValidationError::Zero("limits.concurrency"));
    }
    if limits.max_connections == Some(0) {
        errors.push(ValidationError::Zero("limits.max_connections"));
    }
    if limits.max_requests == Some(0) {
        errors.push(ValidationError::Zero("limits.max_requests"));
    }
    if limits.max_pipeline_depth == 0 {
        errors.push(ValidationError::Zero("limits.max_pipeline_depth"));
    }
    if limits.max_head_size < MIN_HEAD_SIZE {
        errors.push(ValidationError::HeadSizeTooSmall(limits.max_head_size));
    }

    if config.timeouts.keep_alive_secs > MAX_KEEP_ALIVE_SECS {
        errors.push(ValidationError::KeepAliveTooLong(config.timeouts.keep_alive_secs));
    }
    if config.timeouts.lifespan_secs == 0 {
        errors.push(ValidationError::Zero("timeouts.lifespan_secs"));
    }

    for (name, value) in &config.http.headers {
        if !is_valid_header_name(name.as_bytes()) || !is_valid_header_value(value.as_bytes()) {
            errors.push(ValidationError::InvalidHeader(name.clone()));
        }
    }
    let root = &config.http.root_path;
    if !root.is_empty() && !root.starts_with('/') {
        errors.push(ValidationError::InvalidRootPath(root.clone()));
    }

    let observability = &config.observability;
    if observability.metrics_enabled
        && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address",
            value: observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = ServerConfig::default();
        config.listener.bind_address = "not-an-address".into();
        config.limits.concurrency = Some(0);
        config.limits.max_head_size = 10;
        config.http.headers.push(("x-bad\r\n".into(), "v".into()));
        config.http.root_path = "app".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.contains(&ValidationError::Zero("limits.concurrency")));
        assert!(errors.contains(&ValidationError::HeadSizeTooSmall(10)));
    }

    #[test]
    fn metrics_address_only_checked_when_enabled() {
        let mut config = ServerConfig::default();
        config.observability.metrics_address = "nope".into();
        assert!(validate_config(&config).is_ok());

        config.observability.metrics_enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors[0].to_string(),
            "invalid observability.metrics_address address \"nope\""
        );
    }
}
