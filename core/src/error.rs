// Error types surfaced by the connection controller

use crate::retry::BackoffError;
use crate::transport::TransportError;
use thiserror::Error;

/// Errors returned to callers of [`crate::ConnectionManager`]
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Gave up after {attempts} failed connection cycles")]
    RetryExhausted { attempts: u64 },

    #[error("Already running")]
    AlreadyRunning,

    #[error("Invalid settings: {0}")]
    InvalidSettings(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl From<BackoffError> for LoggerError {
    fn from(err: BackoffError) -> Self {
        LoggerError::InvalidSettings(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_errors_convert() {
        let err: LoggerError = TransportError::NotConnected.into();
        assert!(matches!(
            err,
            LoggerError::Transport(TransportError::NotConnected)
        ));
        assert_eq!(err.to_string(), "Transport error: Not connected");
    }

    #[test]
    fn test_backoff_errors_are_settings_errors() {
        let err: LoggerError = BackoffError::InvalidConfig("cap below initial".into()).into();
        assert!(matches!(err, LoggerError::InvalidSettings(_)));
        assert!(err.to_string().contains("cap below initial"));
    }

    #[test]
    fn test_exhaustion_message() {
        let err = LoggerError::RetryExhausted { attempts: 3 };
        assert_eq!(err.to_string(), "Gave up after 3 failed connection cycles");
    }
}
