use chrono::{DateTime, Utc};
use screenguard_alerts::{AlertLevel, AlertStats, Channel, ChannelConfig, ChannelConfigUpdate};
use screenguard_detector::{DetectionSignal, GazeClassifier, GazeThresholds};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

use crate::error::SessionError;

/// Per-user detection behavior, read by the sampling loop on every frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionSettings {
    pub pitch_threshold: f64,
    pub yaw_threshold: f64,
    /// Peeking frames must be strictly above this confidence to raise an alert
    pub alert_floor: f64,
    pub alert_level: AlertLevel,
    pub channels: Vec<Channel>,
    pub message: Option<String>,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        let thresholds = GazeThresholds::default();
        Self {
            pitch_threshold: thresholds.pitch_degrees,
            yaw_threshold: thresholds.yaw_degrees,
            alert_floor: 0.7,
            alert_level: AlertLevel::Medium,
            channels: vec![Channel::Visual, Channel::Audio, Channel::Haptic],
            message: None,
        }
    }
}

impl DetectionSettings {
    #[must_use]
    pub const fn thresholds(&self) -> GazeThresholds {
        GazeThresholds {
            pitch_degrees: self.pitch_threshold,
            yaw_degrees: self.yaw_threshold,
        }
    }

    #[must_use]
    pub const fn classifier(&self) -> GazeClassifier {
        GazeClassifier::new(self.thresholds())
    }

    /// # Errors
    ///
    /// Returns `SessionError::InvalidSettings` for bad thresholds or an alert floor outside `[0, 1]`
    pub fn validate(&self) -> Result<(), SessionError> {
        self.thresholds()
            .validate()
            .map_err(SessionError::InvalidSettings)?;
        if !(0.0..=1.0).contains(&self.alert_floor) {
            return Err(SessionError::InvalidSettings(format!(
                "alert floor {} must be within [0, 1]",
                self.alert_floor
            )));
        }
        Ok(())
    }
}

/// Partial configuration change sent by a client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigUpdate {
    pub pitch_threshold: Option<f64>,
    pub yaw_threshold: Option<f64>,
    pub alert_floor: Option<f64>,
    pub alert_level: Option<AlertLevel>,
    pub channels: Option<Vec<Channel>>,
    pub message: Option<String>,
    /// Channel-level changes forwarded to the alert engine
    pub channel_configs: BTreeMap<Channel, ChannelConfigUpdate>,
}

impl ConfigUpdate {
    /// Merge onto `base` and validate the result
    ///
    /// # Errors
    ///
    /// Returns `SessionError::InvalidSettings` if the merged settings are invalid
    pub fn apply(&self, base: &DetectionSettings) -> Result<DetectionSettings, SessionError> {
        let mut next = base.clone();
        if let Some(pitch) = self.pitch_threshold {
            next.pitch_threshold = pitch;
        }
        if let Some(yaw) = self.yaw_threshold {
            next.yaw_threshold = yaw;
        }
        if let Some(floor) = self.alert_floor {
            next.alert_floor = floor;
        }
        if let Some(level) = self.alert_level {
            next.alert_level = level;
        }
        if let Some(channels) = &self.channels {
            next.channels.clone_from(channels);
        }
        if let Some(message) = &self.message {
            next.message = (!message.is_empty()).then(|| message.clone());
        }
        next.validate()?;
        Ok(next)
    }
}

/// Effective configuration echoed back after an update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigAck {
    pub settings: DetectionSettings,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of one user's session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionStatus {
    pub user_id: String,
    pub is_active: bool,
    pub state: SessionState,
    pub last_signal: Option<DetectionSignal>,
    pub last_status_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub frames_processed: u64,
    pub alerts_dispatched: u64,
    pub settings: DetectionSettings,
    pub alert_stats: AlertStats,
}
