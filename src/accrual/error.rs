use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AccrualError {
    /// HTTP 429. Transient: the caller should back off and retry the order later.
    #[error("Accrual service rate limit exceeded")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Accrual service returned unexpected status {0}")]
    UnexpectedStatus(u16),

    #[error("Accrual request failed: {0}")]
    Transport(String),

    #[error("Malformed accrual response: {0}")]
    Decode(String),
}

impl AccrualError {
    /// Only a rate limit is worth retrying on the same worker
    pub fn is_transient(&self) -> bool {
        matches!(self, AccrualError::RateLimited { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            AccrualError::RateLimited { .. } => "ACCRUAL_RATE_LIMITED",
            AccrualError::UnexpectedStatus(_) => "ACCRUAL_UNEXPECTED_STATUS",
            AccrualError::Transport(_) => "ACCRUAL_TRANSPORT",
            AccrualError::Decode(_) => "ACCRUAL_DECODE",
        }
    }
}

impl From<reqwest::Error> for AccrualError {
    fn from(e: reqwest::Error) -> Self {
        AccrualError::Transport(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_rate_limit_is_transient() {
        assert!(AccrualError::RateLimited { retry_after: None }.is_transient());
        assert!(!AccrualError::UnexpectedStatus(500).is_transient());
        assert!(!AccrualError::Transport("connection refused".into()).is_transient());
        assert!(!AccrualError::Decode("eof".into()).is_transient());
    }

    #[test]
    fn test_display() {
        assert_eq!(
            AccrualError::UnexpectedStatus(503).to_string(),
            "Accrual service returned unexpected status 503"
        );
        assert_eq!(
            AccrualError::RateLimited { retry_after: None }.code(),
            "ACCRUAL_RATE_LIMITED"
        );
    }
}
