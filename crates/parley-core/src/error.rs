use std::time::Duration;

/// Errors surfaced by the upstream model service.
/// Classified as fatal (don't retry), retryable, or operational so the
/// acting participant can decide what to show and whether to try again.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ModelError {
    // Fatal — don't retry
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ModelError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::Overloaded
                | Self::NetworkError(_)
                | Self::StreamInterrupted(_)
        )
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::AuthenticationFailed(_) | Self::InvalidRequest(_))
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::NetworkError(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Human-readable line for the local user.
    pub fn user_message(&self) -> String {
        match self {
            Self::AuthenticationFailed(_) => {
                "Authentication with the model service failed. Check your credentials.".into()
            }
            Self::InvalidRequest(detail) => format!("The model rejected the request: {detail}"),
            Self::RateLimited { .. } => "The model service is rate limiting requests. Try again shortly.".into(),
            Self::Overloaded => "The model service is overloaded. Try again shortly.".into(),
            Self::ServerError { status, .. } => {
                format!("The model service returned an error ({status}). Try again.")
            }
            Self::NetworkError(_) | Self::StreamInterrupted(_) => {
                "Lost the connection to the model service mid-turn.".into()
            }
            Self::Timeout(d) => format!("The model did not respond within {}s.", d.as_secs()),
            Self::Cancelled => "The turn was cancelled.".into(),
        }
    }

    /// Classify an HTTP status code into the appropriate variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}
