use {
    studio_protocol::{ErrorShape, close_codes, error_codes},
    thiserror::Error,
};

/// Why the relay could not (or can no longer) carry a caller's session.
#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("failed to load gateway settings: {0}")]
    SettingsLoad(String),

    #[error("gateway url is not configured")]
    UrlMissing,

    #[error("gateway url is invalid: {0}")]
    UrlInvalid(String),

    #[error("no gateway token from the caller or the relay")]
    TokenMissing,

    #[error("upstream gateway error: {0}")]
    Upstream(String),

    #[error("upstream gateway closed: {0}")]
    UpstreamClosed(String),

    #[error("more than {0} frames sent before the upstream opened")]
    BacklogFull(usize),
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SettingsLoad(_) => error_codes::SETTINGS_LOAD_FAILED,
            Self::UrlMissing => error_codes::GATEWAY_URL_MISSING,
            Self::UrlInvalid(_) => error_codes::GATEWAY_URL_INVALID,
            Self::TokenMissing => error_codes::GATEWAY_TOKEN_MISSING,
            Self::Upstream(_) => error_codes::UPSTREAM_ERROR,
            Self::UpstreamClosed(_) => error_codes::UPSTREAM_CLOSED,
            Self::BacklogFull(_) => error_codes::BACKLOG_FULL,
        }
    }

    /// Close code sent to the caller after reporting this error.
    pub fn close_code(&self) -> u16 {
        match self {
            Self::UpstreamClosed(_) => close_codes::SERVICE_RESTART,
            Self::BacklogFull(_) => close_codes::POLICY_VIOLATION,
            _ => close_codes::INTERNAL,
        }
    }

    pub fn to_error_shape(&self) -> ErrorShape {
        let mut shape = ErrorShape::new(self.code(), self.to_string());
        if matches!(self, Self::Upstream(_) | Self::UpstreamClosed(_)) {
            shape.retryable = Some(true);
        }
        shape
    }
}
