//! Error taxonomy for the link, the bootstrap and configuration.
//!
//! DESIGN
//! ======
//! `LinkError` is what every awaitable in the crate settles with when it does
//! not produce a value. Each variant carries a grepable code and a retryable
//! flag so callers can decide whether reconnecting makes sense.

use serde_json::Value;

/// Grepable error code and retryable flag for structured error reporting.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

// =============================================================================
// LINK ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkError {
    /// A send was attempted after the channel closed.
    #[error("channel closed")]
    ChannelClosed,
    /// A live virtual channel with this name already exists.
    #[error("duplicate channel name: {0}")]
    DuplicateChannelName(String),
    /// The peer went away while the call was pending.
    #[error("connection lost while awaiting `{method}`")]
    ConnectionLost { method: String },
    /// The peer answered with an error response.
    #[error("remote error: {message}")]
    RemoteError { message: String, code: Option<i64>, data: Option<Value> },
    /// A reply did not have the expected shape.
    #[error("failed to decode reply: {0}")]
    Decode(String),
}

impl LinkError {
    #[must_use]
    pub fn connection_lost(method: impl Into<String>) -> Self {
        Self::ConnectionLost { method: method.into() }
    }

    /// Convert a wire-level fault into a [`LinkError::RemoteError`].
    #[must_use]
    pub fn from_fault(fault: frames::RemoteFault) -> Self {
        Self::RemoteError { message: fault.message, code: fault.code, data: fault.data }
    }
}

impl ErrorCode for LinkError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ChannelClosed => "E_CHANNEL_CLOSED",
            Self::DuplicateChannelName(_) => "E_DUPLICATE_CHANNEL",
            Self::ConnectionLost { .. } => "E_CONNECTION_LOST",
            Self::RemoteError { .. } => "E_REMOTE",
            Self::Decode(_) => "E_DECODE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost { .. })
    }
}

// =============================================================================
// BOOTSTRAP ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("failed to load locale messages: {0}")]
    Locale(String),
    #[error("failed to connect to background: {0}")]
    Connect(String),
    #[error("failed to launch ui: {0}")]
    Launch(String),
    #[error(transparent)]
    Link(#[from] LinkError),
}

impl ErrorCode for BootstrapError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Locale(_) => "E_LOCALE",
            Self::Connect(_) => "E_CONNECT",
            Self::Launch(_) => "E_LAUNCH",
            Self::Link(err) => err.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Connect(_) => true,
            Self::Link(err) => err.retryable(),
            Self::Locale(_) | Self::Launch(_) => false,
        }
    }
}

// =============================================================================
// CONFIG ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

#[cfg(test)]
#[path = "error_test.rs"]
mod tests;
