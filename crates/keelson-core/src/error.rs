//! Error types for Keelson

use thiserror::Error;

/// Result type alias using Keelson's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Data model errors with codes and suggestions
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid delta: {0}")]
    InvalidDelta(String),

    #[error("Unknown notification state '{0}'. Expected one of normal, alert, warn, alarm, emergency.")]
    InvalidNotificationState(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidDelta(_) => "E001",
            Self::InvalidNotificationState(_) => "E002",
            Self::Json(_) => "E998",
        }
    }

    /// Get a suggested action for this error, if any
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::InvalidNotificationState(_) => Some("use one of: normal, alert, warn, alarm, emergency"),
            Self::InvalidDelta(_) => Some("a delta needs an `updates` array of `values` or `meta` entries"),
            Self::Json(_) => None,
        }
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod error_tests;
