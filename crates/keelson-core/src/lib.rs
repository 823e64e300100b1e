//! Keelson Core Library
//!
//! Shared pieces used by the plugin host and the CLI:
//! - Normalized data model (deltas, notifications, server events)
//! - Data model errors with codes and suggestions
//! - Server configuration persisted as TOML

pub mod config;
pub mod error;
pub mod model;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::ServerConfig;
    pub use crate::error::{Error, Result};
    pub use crate::model::{Delta, ServerEvent, SkVersion};
}
