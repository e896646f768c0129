//! HTTP/1.x protocol handling.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → parser.rs   (request head, body framing, pipelining)
//!     → engine.rs   (per-connection state machine, flow control)
//!     → cycle.rs    (one request/response exchange with the application)
//!     → response.rs (status line, headers, chunked encoding)
//!     → transport
//! ```

pub mod cycle;
pub mod engine;
pub mod message;
pub mod parser;
pub mod response;
pub mod scope;
pub mod status;

pub use cycle::SendError;
pub use engine::{ConnectionPhase, HttpConnection};
pub use message::Message;
pub use parser::{ParseError, RequestHead};
pub use scope::{Headers, HttpScope, HttpVersion, Interface, LifespanScope, ProtocolInfo, Scope};
