use screenguard_alerts::AlertError;
use thiserror::Error;

/// Errors surfaced by session operations
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Alert(#[from] AlertError),

    #[error("invalid detection settings: {0}")]
    InvalidSettings(String),

    #[error("failed to open signal source for {user_id}: {reason}")]
    Source { user_id: String, reason: String },
}

impl SessionError {
    /// Returns true if the request itself was bad, as opposed to a runtime failure
    #[must_use]
    pub const fn is_rejected_input(&self) -> bool {
        match self {
            Self::InvalidSettings(_) => true,
            Self::Alert(err) => err.is_validation() || err.is_config(),
            Self::Source { .. } => false,
        }
    }
}

/// Push channel failures; any of them ends the connection
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("push channel closed")]
    Closed,

    #[error("transport I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed message: {0}")]
    Codec(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_input_classification() {
        assert!(SessionError::Alert(AlertError::EmptyUserId).is_rejected_input());
        assert!(SessionError::InvalidSettings("alert floor".into()).is_rejected_input());
        assert!(SessionError::Alert(AlertError::InvalidThreshold(2.0)).is_rejected_input());
        assert!(!SessionError::Source {
            user_id: "alice".into(),
            reason: "camera busy".into()
        }
        .is_rejected_input());
    }

    #[test]
    fn test_alert_errors_convert_transparently() {
        let err: SessionError = AlertError::EmptyUserId.into();
        assert_eq!(err.to_string(), "user id must not be empty");
    }
}
