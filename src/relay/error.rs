use std::fmt;

use super::protocol::{EXTENSION_ERROR, INTERNAL_ERROR};

/// Errors raised while brokering traffic between clients and the extension.
#[derive(Debug)]
pub enum RelayError {
    /// No extension is connected and ready.
    ExtensionAbsent,

    /// A forwarded command did not receive an extension response in time.
    CommandTimeout {
        /// The extension method that timed out.
        method: String,
    },

    /// The extension connection went away while a command was in flight.
    LinkClosed,

    /// The extension reported a failure; message is carried verbatim.
    Extension(String),

    /// Internal error (e.g., a channel closed unexpectedly).
    Internal(String),
}

impl RelayError {
    /// The CDP error code this error surfaces as on a client response.
    #[must_use]
    pub fn cdp_code(&self) -> i64 {
        match self {
            Self::Extension(_) => EXTENSION_ERROR,
            Self::ExtensionAbsent
            | Self::CommandTimeout { .. }
            | Self::LinkClosed
            | Self::Internal(_) => INTERNAL_ERROR,
        }
    }

    /// The CDP error message this error surfaces as on a client response.
    #[must_use]
    pub fn cdp_message(&self) -> String {
        match self {
            Self::ExtensionAbsent => "extension not connected".into(),
            Self::CommandTimeout { .. } => "extension command timed out".into(),
            Self::LinkClosed => "extension connection closed".into(),
            Self::Extension(message) => message.clone(),
            Self::Internal(message) => format!("internal error: {message}"),
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExtensionAbsent => write!(f, "extension not connected"),
            Self::CommandTimeout { method } => {
                write!(f, "extension command timed out: {method}")
            }
            Self::LinkClosed => write!(f, "extension connection closed"),
            Self::Extension(message) => write!(f, "extension error: {message}"),
            Self::Internal(message) => write!(f, "relay internal error: {message}"),
        }
    }
}

impl std::error::Error for RelayError {}
