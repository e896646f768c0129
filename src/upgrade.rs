//! Protocol upgrade handoff.
//!
//! When a request asks to switch protocols (`Upgrade` plus
//! `Connection: upgrade`) and a handler for that protocol is configured,
//! the connection engine stops speaking HTTP and gives the handler the
//! transport, the parsed request scope and any bytes that arrived after the
//! request head. From then on the engine only forwards socket events.

use std::sync::Arc;

use bytes::Bytes;

use crate::http::scope::HttpScope;
use crate::net::transport::Transport;

/// Everything a protocol handler needs to take over a connection.
pub struct UpgradeHandoff {
    pub transport: Arc<dyn Transport>,
    pub scope: HttpScope,
    /// Bytes received past the upgrade request's head.
    pub buffered: Bytes,
}

/// A connection that has left HTTP.
pub trait UpgradedProtocol: Send {
    fn data_received(&mut self, data: &[u8]);

    fn connection_lost(&mut self);
}

/// Accepts upgrades to one protocol.
pub trait UpgradeHandler: Send + Sync {
    /// Lowercase protocol token as it appears in the `Upgrade` header,
    /// e.g. `websocket`.
    fn protocol(&self) -> &str;

    fn upgrade(&self, handoff: UpgradeHandoff) -> Box<dyn UpgradedProtocol>;
}
