//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML) + command line overrides
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → shared via Arc to the engine and its collaborators
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; nothing mutates it after startup
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    HttpConfig, InterfaceMode, LifespanConfig, LifespanMode, LimitsConfig, ListenerConfig,
    ObservabilityConfig, ParserKind, ServerConfig, TimeoutConfig,
};
pub use validation::{validate_config, ValidationError};
