//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup:
//!     Load config → Validate → lifespan.rs (startup handshake) → Accept traffic
//!
//! Shutdown (shutdown.rs):
//!     Signal / request limit → Stop accepting → Drain connections
//!         → lifespan.rs (shutdown handshake) → Exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Listeners accept nothing until the application reports startup complete
//! - Ordered shutdown: stop accept, drain, notify application
//! - Draining has an optional timeout, after which connections are dropped

pub mod lifespan;
pub mod shutdown;
pub mod signals;

pub use lifespan::{Lifespan, LifespanError, LifespanState};
pub use shutdown::Shutdown;
