//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber once, from the binary
//! - Name the log targets the rest of the crate writes to
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level when set
//! - Library code only emits events; it never installs a subscriber

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Server and connection lifecycle, application failures, bad requests.
pub const ERROR_TARGET: &str = "portico::error";
/// One line per completed response.
pub const ACCESS_TARGET: &str = "portico::access";
/// Message-level tracing of application traffic.
pub const APP_TARGET: &str = "portico::app";

/// Filter directive used when `RUST_LOG` is unset.
pub fn default_directive(level: &str) -> String {
    format!("portico={level},{level}")
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(level)));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directive_applies_to_crate_and_dependencies() {
        assert_eq!(default_directive("debug"), "portico=debug,debug");
        assert!(EnvFilter::try_new(default_directive("trace")).is_ok());
    }
}
