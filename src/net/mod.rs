//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (bind with backlog, accept)
//!     → connection.rs (id + active-connection guard)
//!     → driver.rs (one task per socket: reads, timers, app events)
//!         → transport.rs (queued writes, read-pause flag)
//!         → http::engine (protocol state machine)
//! ```
//!
//! # Design Decisions
//! - Connection limits are enforced at accept time with an immediate 503
//! - Each connection is counted by a guard, so panics never leak a slot
//! - The engine sees only the `Transport` trait, never the socket

pub mod connection;
pub mod driver;
pub mod listener;
pub mod transport;

pub use connection::{ConnectionGuard, ConnectionId};
pub use driver::{serve_connection, ConnectionContext};
pub use listener::{Listener, ListenerError};
pub use transport::{ExtraInfo, ExtraInfoKey, StreamTransport, Transport};
