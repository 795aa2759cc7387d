use thiserror::Error;

use crate::types::Channel;

/// Errors raised by the alert engine
///
/// Validation and configuration errors are returned to the caller before any
/// shared state is touched. Handler errors never leave the engine; they are only
/// built to be logged.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AlertError {
    // Validation errors
    #[error("user id must not be empty")]
    EmptyUserId,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("unknown alert level: {0}")]
    UnknownLevel(String),

    // Configuration errors
    #[error("invalid threshold {0}: must be within [0, 1]")]
    InvalidThreshold(f64),

    #[error("invalid rate window for {0}: must be at least one second")]
    InvalidWindow(Channel),

    #[error("configuration for {configured} cannot be installed on channel {channel}")]
    ChannelMismatch { channel: Channel, configured: Channel },

    // Contained errors
    #[error("{handler} handler failed on {channel} alert {alert_id}: {reason}")]
    Handler {
        handler: String,
        channel: Channel,
        alert_id: String,
        reason: String,
    },
}

impl AlertError {
    /// Returns true for bad input that never reached the engine's state
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyUserId | Self::UnknownChannel(_) | Self::UnknownLevel(_)
        )
    }

    /// Returns true if a channel configuration was rejected
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(
            self,
            Self::InvalidThreshold(_) | Self::InvalidWindow(_) | Self::ChannelMismatch { .. }
        )
    }
}

/// Reject empty or whitespace-only user ids
///
/// # Errors
///
/// Returns `AlertError::EmptyUserId`
pub fn validate_user_id(user_id: &str) -> Result<(), AlertError> {
    if user_id.trim().is_empty() {
        return Err(AlertError::EmptyUserId);
    }
    Ok(())
}
