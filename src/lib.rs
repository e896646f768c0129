//! HTTP/1.x application server.
//!
//! Applications implement [`app::Application`] (or a two-step
//! [`app::ApplicationFactory`]) and talk to the server through a scope and
//! a pair of receive/send handles.

pub mod app;
pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod server;
pub mod state;
pub mod upgrade;

pub use app::{AppError, AppResult, Application, LoadedApp, Receive, Sender};
pub use config::ServerConfig;
pub use http::{Message, Scope};
pub use lifecycle::Shutdown;
pub use server::{Server, ServerError};
