use {
    studio_protocol::{ConnectFailure, ErrorShape, error_codes},
    thiserror::Error,
    tokio_tungstenite::tungstenite,
};

/// Failure of a single RPC call.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("gateway is not connected")]
    NotConnected,

    #[error("gateway connection closed before the response arrived")]
    Disconnected,

    /// The gateway answered `ok: false`.
    #[error("request failed: {0}")]
    Call(ErrorShape),

    #[error(transparent)]
    Protocol(#[from] studio_protocol::Error),
}

impl ClientError {
    /// Protocol error code, when the failure carries one.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Call(shape) => Some(&shape.code),
            _ => None,
        }
    }
}

/// Failure to establish a session.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The gateway (or relay) refused the handshake.
    #[error("connect rejected: {0}")]
    Rejected(ConnectFailure),

    #[error("connection closed during handshake (code {code}): {reason}")]
    Closed { code: u16, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] studio_protocol::Error),

    /// `disconnect()` was called while the handshake was in flight.
    #[error("connect cancelled")]
    Cancelled,
}

impl ConnectError {
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Rejected(failure) => Some(&failure.code),
            _ => None,
        }
    }

    /// Whether trying again could succeed without a configuration change.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Rejected(failure) => failure.is_retryable(),
            Self::Protocol(_) | Self::Cancelled => false,
            Self::Closed { .. } | Self::Transport(_) => true,
        }
    }

    pub(crate) fn rejected(code: &str, message: impl Into<String>) -> Self {
        Self::Rejected(ConnectFailure::new(code, message))
    }

    pub(crate) fn is_auth_failure(&self) -> bool {
        self.code().is_some_and(|code| {
            code == error_codes::UNAUTHORIZED || code.to_ascii_lowercase().contains("auth")
        })
    }
}
