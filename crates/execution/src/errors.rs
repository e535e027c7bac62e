use std::time::Duration;

/// What a handler can fail with, and what the engine synthesizes itself.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Retry later: after `delay`, or in the very next cycle when `None`.
    #[error("{message}")]
    Temporary { message: String, delay: Option<Duration> },
    /// Give up on this handler; other handlers are not affected.
    #[error("{0}")]
    Permanent(String),
    /// Anything else; treated according to the handler's [`ErrorsMode`].
    #[error(transparent)]
    Other(#[from] anyhow::Error),
    #[error("handler has timed out after {0:?}")]
    Timeout(Duration),
    #[error("handler has exceeded {0} retries")]
    RetriesExceeded(u32),
    /// The handler's task was cancelled from outside; never retried.
    #[error("handler was cancelled: {0}")]
    Cancelled(String),
    /// Sub-handlers are not done yet; the parent is retried.
    #[error("sub-handlers are not done yet")]
    ChildrenPending { delay: Option<Duration> },
}

impl HandlerError {
    pub fn temporary(message: impl Into<String>, delay: Duration) -> Self {
        HandlerError::Temporary { message: message.into(), delay: Some(delay) }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        HandlerError::Permanent(message.into())
    }

    /// Fatal for the handler no matter the errors mode.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            HandlerError::Permanent(_)
                | HandlerError::Timeout(_)
                | HandlerError::RetriesExceeded(_)
                | HandlerError::Cancelled(_)
        )
    }
}

/// How arbitrary errors ([`HandlerError::Other`]) are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorsMode {
    /// Logged, then the handler counts as succeeded with no result.
    Ignored,
    /// Retried after the handler's backoff.
    #[default]
    Temporary,
    /// The handler fails for good.
    Permanent,
}

impl std::str::FromStr for ErrorsMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ignored" => Ok(ErrorsMode::Ignored),
            "temporary" => Ok(ErrorsMode::Temporary),
            "permanent" => Ok(ErrorsMode::Permanent),
            other => Err(format!("unknown errors mode: {other}")),
        }
    }
}

pub type HandlerResult = Result<Option<serde_json::Value>, HandlerError>;
