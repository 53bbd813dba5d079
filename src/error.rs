use thiserror::Error;
use uuid::Uuid;

use crate::domain::DenyCode;

/// Whether an exchange failure may be retried by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeErrorKind {
    /// Network blips, timeouts, 5xx, rate limits
    Retryable,
    /// Auth failures, rejected requests, unknown symbols
    Terminal,
}

impl std::fmt::Display for ExchangeErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeErrorKind::Retryable => write!(f, "retryable"),
            ExchangeErrorKind::Terminal => write!(f, "terminal"),
        }
    }
}

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum PerpError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    // Network errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Input errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Risk gate rejection
    #[error("Risk denied [{code}]: {reason}")]
    RiskDenied {
        code: DenyCode,
        reason: String,
        correlation_id: Uuid,
    },

    // Exchange connector failures
    #[error("Exchange error ({kind}): {message}")]
    Exchange {
        kind: ExchangeErrorKind,
        message: String,
    },

    #[error("Timeout: {0}")]
    Timeout(String),

    // State machine errors
    #[error("Invalid state transition for {entity}: from {from} to {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },

    #[error("Invalid state: {0}")]
    State(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for PerpError
pub type Result<T> = std::result::Result<T, PerpError>;

impl PerpError {
    pub fn retryable(message: impl Into<String>) -> Self {
        PerpError::Exchange {
            kind: ExchangeErrorKind::Retryable,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        PerpError::Exchange {
            kind: ExchangeErrorKind::Terminal,
            message: message.into(),
        }
    }

    /// Only transient exchange and transport faults are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            PerpError::Exchange { kind, .. } => *kind == ExchangeErrorKind::Retryable,
            PerpError::WebSocket(_) | PerpError::Timeout(_) => true,
            _ => false,
        }
    }

    /// Short, stable label used for counters and log fields.
    pub fn category(&self) -> &'static str {
        match self {
            PerpError::Config(_) => "config",
            PerpError::Database(_) | PerpError::Migration(_) => "database",
            PerpError::WebSocket(_) => "websocket",
            PerpError::Json(_) => "json",
            PerpError::Validation(_) => "validation",
            PerpError::RiskDenied { .. } => "risk_denied",
            PerpError::Exchange { .. } => "exchange",
            PerpError::Timeout(_) => "timeout",
            PerpError::InvalidStateTransition { .. } | PerpError::State(_) => "state",
            PerpError::Io(_) => "io",
            PerpError::Internal(_) | PerpError::Other(_) => "internal",
            PerpError::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for PerpError {
    fn from(err: reqwest::Error) -> Self {
        let transient = err.is_timeout()
            || err.is_connect()
            || err
                .status()
                .map(|s| s.is_server_error() || s.as_u16() == 429)
                .unwrap_or(false);
        if transient {
            PerpError::retryable(err.to_string())
        } else {
            PerpError::terminal(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PerpError::retryable("502 bad gateway").is_retryable());
        assert!(!PerpError::terminal("invalid api key").is_retryable());
        assert!(PerpError::Timeout("fill".into()).is_retryable());
        assert!(!PerpError::Validation("size".into()).is_retryable());
    }

    #[test]
    fn test_risk_denied_display_carries_code() {
        let err = PerpError::RiskDenied {
            code: DenyCode::DailyLoss,
            reason: "Daily loss limit exceeded".to_string(),
            correlation_id: Uuid::new_v4(),
        };
        let text = err.to_string();
        assert!(text.contains("daily_loss"));
        assert!(text.contains("Daily loss limit"));
        assert_eq!(err.category(), "risk_denied");
    }
}
