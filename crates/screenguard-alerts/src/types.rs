use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

use crate::error::AlertError;

/// Fallback message when neither the caller nor the channel supplies one
pub const DEFAULT_PEEK_MESSAGE: &str = "Screen peeking detected!";

/// Default trailing window for the per-minute rate limit
pub const DEFAULT_WINDOW_SECONDS: u64 = 60;

/// Free-form metadata attached to an alert
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Notification modality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Visual,
    Audio,
    Haptic,
    Notification,
    Email,
    Sms,
}

impl Channel {
    pub const ALL: [Self; 6] = [
        Self::Visual,
        Self::Audio,
        Self::Haptic,
        Self::Notification,
        Self::Email,
        Self::Sms,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Visual => "visual",
            Self::Audio => "audio",
            Self::Haptic => "haptic",
            Self::Notification => "notification",
            Self::Email => "email",
            Self::Sms => "sms",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|channel| channel.as_str() == needle)
            .ok_or_else(|| AlertError::UnknownChannel(s.to_string()))
    }
}

/// Alert severity
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl AlertLevel {
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for AlertLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertLevel {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|level| level.as_str() == needle)
            .ok_or_else(|| AlertError::UnknownLevel(s.to_string()))
    }
}

/// Admission settings for one channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: Channel,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_seconds: u64,
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,
    #[serde(default = "default_window")]
    pub window_seconds: u64,
    #[serde(default)]
    pub custom_message: Option<String>,
}

const fn default_enabled() -> bool {
    true
}

const fn default_threshold() -> f64 {
    0.7
}

const fn default_cooldown() -> u64 {
    5
}

const fn default_max_per_minute() -> u32 {
    10
}

const fn default_window() -> u64 {
    DEFAULT_WINDOW_SECONDS
}

impl ChannelConfig {
    /// Generic configuration: enabled, threshold 0.7, 5s cooldown, 10 per minute
    #[must_use]
    pub const fn new(channel: Channel) -> Self {
        Self {
            channel,
            enabled: default_enabled(),
            threshold: default_threshold(),
            cooldown_seconds: default_cooldown(),
            max_per_minute: default_max_per_minute(),
            window_seconds: DEFAULT_WINDOW_SECONDS,
            custom_message: None,
        }
    }

    /// Built-in configurations for the channels that work out of the box
    ///
    /// Email and SMS need an explicit configuration before they admit anything.
    #[must_use]
    pub fn builtin_defaults() -> Vec<Self> {
        vec![
            Self::new(Channel::Visual)
                .with_threshold(0.7)
                .with_cooldown(3)
                .with_max_per_minute(20),
            Self::new(Channel::Audio)
                .with_threshold(0.8)
                .with_cooldown(5)
                .with_max_per_minute(10),
            Self::new(Channel::Haptic)
                .with_threshold(0.6)
                .with_cooldown(2)
                .with_max_per_minute(30),
            Self::new(Channel::Notification)
                .with_threshold(0.7)
                .with_cooldown(10)
                .with_max_per_minute(5),
        ]
    }

    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, seconds: u64) -> Self {
        self.cooldown_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_per_minute(mut self, max: u32) -> Self {
        self.max_per_minute = max;
        self
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.custom_message = Some(message.into());
        self
    }

    /// Validate value ranges
    ///
    /// # Errors
    ///
    /// Returns a configuration error for a threshold outside `[0, 1]` or a zero window
    pub fn validate(&self) -> Result<(), AlertError> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(AlertError::InvalidThreshold(self.threshold));
        }
        if self.window_seconds == 0 {
            return Err(AlertError::InvalidWindow(self.channel));
        }
        Ok(())
    }
}

/// Partial update of a channel configuration; absent fields keep their value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfigUpdate {
    pub enabled: Option<bool>,
    pub threshold: Option<f64>,
    pub cooldown_seconds: Option<u64>,
    pub max_per_minute: Option<u32>,
    pub window_seconds: Option<u64>,
    pub custom_message: Option<String>,
}

impl ChannelConfigUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Merge onto `base`; an empty `custom_message` clears the message
    #[must_use]
    pub fn apply(&self, base: &ChannelConfig) -> ChannelConfig {
        let mut next = base.clone();
        if let Some(enabled) = self.enabled {
            next.enabled = enabled;
        }
        if let Some(threshold) = self.threshold {
            next.threshold = threshold;
        }
        if let Some(cooldown) = self.cooldown_seconds {
            next.cooldown_seconds = cooldown;
        }
        if let Some(max) = self.max_per_minute {
            next.max_per_minute = max;
        }
        if let Some(window) = self.window_seconds {
            next.window_seconds = window;
        }
        if let Some(message) = &self.custom_message {
            next.custom_message = (!message.is_empty()).then(|| message.clone());
        }
        next
    }
}

/// An admitted alert; immutable once created
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub alert_id: String,
    pub user_id: String,
    pub channel: Channel,
    pub level: AlertLevel,
    pub message: String,
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Caller-supplied part of a dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct AlertRequest {
    pub user_id: String,
    pub level: AlertLevel,
    pub message: Option<String>,
    pub confidence: f64,
    pub metadata: Metadata,
}

impl AlertRequest {
    #[must_use]
    pub fn new(user_id: impl Into<String>, level: AlertLevel, confidence: f64) -> Self {
        Self {
            user_id: user_id.into(),
            level,
            message: None,
            confidence,
            metadata: Metadata::new(),
        }
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
