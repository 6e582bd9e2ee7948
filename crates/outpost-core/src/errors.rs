use std::time::Duration;

/// Typed error hierarchy for monitoring a remote server.
/// Classifies errors as transient (retry next poll), silent, or terminal.
#[derive(Clone, Debug, thiserror::Error)]
pub enum MonitorError {
    // Transient: no state mutation, the next poll proceeds normally
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("rate limited by server")]
    RateLimited,

    // Expected during normal operation
    #[error("not found: {0}")]
    NotFound(String),

    // Aborts the current diff pass
    #[error("protocol error: {0}")]
    Protocol(String),

    // Session lifecycle
    #[error("a connect attempt is already in flight")]
    AlreadyConnecting,
    #[error("reconnect gave up after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("link closed locally")]
    Closed,

    #[error("configuration error: {0}")]
    Config(String),
}

impl MonitorError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::Timeout(_) | Self::RateLimited
        )
    }

    /// Errors that are part of normal operation and must not be logged as failures.
    pub fn is_silent(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::ReconnectExhausted { .. } | Self::Closed | Self::Config(_)
        )
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Timeout(_) => "timeout",
            Self::RateLimited => "rate_limited",
            Self::NotFound(_) => "not_found",
            Self::Protocol(_) => "protocol",
            Self::AlreadyConnecting => "already_connecting",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::Closed => "closed",
            Self::Config(_) => "config",
        }
    }

    /// Classify an error code carried in a server error response.
    pub fn from_code(code: &str) -> Self {
        match code {
            "not_found" | "no_team" | "no_player" | "not_authorized" => {
                Self::NotFound(code.to_string())
            }
            "rate_limit" => Self::RateLimited,
            other => Self::Protocol(format!("server error: {other}")),
        }
    }
}

impl From<serde_json::Error> for MonitorError {
    fn from(e: serde_json::Error) -> Self {
        MonitorError::Protocol(e.to_string())
    }
}
