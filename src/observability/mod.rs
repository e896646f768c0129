//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Connection engine / server produce:
//!     → logging.rs (subscriber setup, log targets)
//!     → access.rs  (one line per completed response)
//!     → metrics.rs (counters and gauges)
//!
//! Consumers:
//!     → stdout via tracing-subscriber
//!     → Prometheus scrape endpoint (optional)
//! ```
//!
//! # Design Decisions
//! - Log lines go to fixed targets so they can be filtered independently
//! - Metrics go through the `metrics` facade; without an installed
//!   recorder every call is a no-op

pub mod access;
pub mod logging;
pub mod metrics;
