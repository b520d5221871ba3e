//! INDI error types
//!
//! Provides structured error types for INDI operations.

use crate::IndiPropertyType;
use std::fmt;
use std::time::Duration;

/// INDI client errors
#[derive(Debug, Clone)]
pub enum IndiError {
    /// Connection to INDI server failed
    ConnectionFailed(String),
    /// Connection timeout with context
    ConnectionTimeout {
        host: String,
        port: u16,
        duration: Duration,
    },
    /// XML parse error
    ParseError(String),
    /// Send channel closed
    ChannelClosed(String),
    /// Not connected to server
    NotConnected,
}

impl std::error::Error for IndiError {}

impl fmt::Display for IndiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndiError::ConnectionFailed(msg) => write!(f, "Connection failed: {}", msg),
            IndiError::ConnectionTimeout { host, port, duration } => {
                write!(
                    f,
                    "Connection timeout: failed to connect to {}:{} after {:?}",
                    host, port, duration
                )
            }
            IndiError::ParseError(msg) => write!(f, "XML parse error: {}", msg),
            IndiError::ChannelClosed(msg) => write!(f, "Channel closed: {}", msg),
            IndiError::NotConnected => write!(f, "Not connected to INDI server"),
        }
    }
}

impl From<IndiError> for String {
    fn from(err: IndiError) -> String {
        err.to_string()
    }
}

/// Result type for INDI operations
pub type IndiResult<T> = Result<T, IndiError>;

/// Reasons a property write is refused or fails.
///
/// Every variant maps onto one HTTP status through [`SetPropertyError::status_code`],
/// so callers can answer a web request without inspecting messages.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SetPropertyError {
    #[error("Not connected to INDI server")]
    NotConnected,

    #[error("Property not found: {device}.{property}")]
    PropertyNotFound { device: String, property: String },

    #[error("Element '{element}' not found in {device}.{property}")]
    ElementNotFound {
        device: String,
        property: String,
        element: String,
    },

    #[error("Permission denied: property '{property}' is read-only")]
    PermissionDenied { property: String },

    #[error("Invalid value '{value}' for element '{element}'")]
    InvalidValue { element: String, value: String },

    #[error("Property type {0:?} cannot be written")]
    UnsupportedType(IndiPropertyType),

    #[error("Communication error: {0}")]
    Communication(String),
}

impl SetPropertyError {
    /// HTTP status code for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            SetPropertyError::NotConnected | SetPropertyError::Communication(_) => 503,
            SetPropertyError::PropertyNotFound { .. } | SetPropertyError::ElementNotFound { .. } => {
                404
            }
            SetPropertyError::PermissionDenied { .. } => 403,
            SetPropertyError::InvalidValue { .. } | SetPropertyError::UnsupportedType(_) => 400,
        }
    }
}

impl From<IndiError> for SetPropertyError {
    fn from(err: IndiError) -> Self {
        match err {
            IndiError::NotConnected => SetPropertyError::NotConnected,
            other => SetPropertyError::Communication(other.to_string()),
        }
    }
}
