//! Error types for the LDAP wire engine.
//!
//! Incomplete input is not an error: the codec reports it as `Ok(None)` so the
//! caller keeps reading. Everything here is surfaced to the caller; nothing in
//! the crate retries on its own.

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LdapError>;

#[derive(Debug, Error)]
pub enum LdapError {
    /// Malformed tag/length, wrong child count, unknown application tag,
    /// missing mandatory field. Indicates a peer bug or version mismatch.
    #[error("protocol error: {message}")]
    Structural { message: String },

    /// A well-formed operation arrived where a different one was required.
    #[error("protocol error: expected {expected}, got {actual}")]
    ProtocolMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// No envelope for `message_id` within the deadline. The queue stays usable.
    #[error("timed out after {timeout:?} waiting for message {message_id}")]
    Timeout { message_id: u32, timeout: Duration },

    #[error("bind failed with result code {result_code}: {diagnostic}")]
    BindFailure { result_code: i32, diagnostic: String },

    /// Non-success result for an operation other than bind.
    #[error("{operation} failed with result code {result_code}: {diagnostic}")]
    OperationFailure {
        operation: &'static str,
        result_code: i32,
        diagnostic: String,
    },

    /// Refused locally, e.g. StartTLS while a SASL security layer is active.
    #[error("invalid state: {message}")]
    InvalidState { message: String },

    #[error("security error: {message}")]
    Security { message: String },

    /// Server-initiated notice carried under message id 0.
    #[error("unsolicited notification {}: result code {result_code}: {diagnostic}", name.as_deref().unwrap_or("(unnamed)"))]
    UnsolicitedNotification {
        name: Option<String>,
        result_code: i32,
        diagnostic: String,
    },

    #[error("SASL error: {message}")]
    Sasl { message: String },
}

impl LdapError {
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural {
            message: message.into(),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    pub fn security(message: impl Into<String>) -> Self {
        Self::Security {
            message: message.into(),
        }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    pub fn sasl(message: impl Into<String>) -> Self {
        Self::Sasl {
            message: message.into(),
        }
    }

    /// True when the connection must be abandoned after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            LdapError::Connection { .. }
            | LdapError::Io(_)
            | LdapError::Structural { .. }
            | LdapError::Security { .. }
            | LdapError::UnsolicitedNotification { .. } => true,
            LdapError::ProtocolMismatch { .. }
            | LdapError::Timeout { .. }
            | LdapError::BindFailure { .. }
            | LdapError::OperationFailure { .. }
            | LdapError::InvalidState { .. }
            | LdapError::Sasl { .. } => false,
        }
    }
}
