use anyhow::{Context, Result};
use screenguard_alerts::{Channel, ChannelConfig, EngineOptions};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{session_manager::SessionOptions, settings::DetectionSettings};

const APP_DIR: &str = "screenguard";

/// Daemon configuration, read from `config.toml`
///
/// Every section is optional; a missing file means all defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenGuardConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    pub engine: EngineSection,
    pub session: SessionSection,
    pub detection: DetectionSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay: Option<ReplaySection>,
    /// Overrides applied on top of the built-in channel defaults
    pub channels: Vec<ChannelConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub handler_timeout_ms: u64,
    /// 0 keeps every alert
    pub history_capacity: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        let options = EngineOptions::default();
        Self {
            handler_timeout_ms: duration_ms(options.handler_timeout),
            history_capacity: options.history_capacity,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub status_interval_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        let options = SessionOptions::default();
        Self {
            status_interval_ms: duration_ms(options.status_interval),
            stop_timeout_ms: duration_ms(options.stop_timeout),
        }
    }
}

/// Forward admitted alerts to an HTTP endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSection {
    pub url: String,
    #[serde(default = "default_webhook_channels")]
    pub channels: Vec<Channel>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_webhook_channels() -> Vec<Channel> {
    vec![Channel::Notification]
}

const fn default_max_attempts() -> u32 {
    3
}

/// Feed every session from a recorded JSON-lines file instead of live frames
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaySection {
    pub path: PathBuf,
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
    #[serde(default = "default_looping")]
    pub looping: bool,
}

const fn default_pace_ms() -> u64 {
    200
}

const fn default_looping() -> bool {
    true
}

impl ScreenGuardConfig {
    /// Load configuration from `path`, or from the default location
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => default_path()?,
        };
        if !path.exists() {
            log::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("invalid config in {}", path.display()))?;
        log::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if `content` is not valid TOML for this schema or holds invalid values
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns an error if any channel or detection setting is out of range
    pub fn validate(&self) -> Result<()> {
        self.detection.validate()?;
        anyhow::ensure!(
            self.session.status_interval_ms > 0,
            "session.status_interval_ms must be at least 1"
        );
        for config in &self.channels {
            config.validate()?;
        }
        if let Some(webhook) = &self.webhook {
            anyhow::ensure!(webhook.max_attempts > 0, "webhook.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Returns an error if serialization fails
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Socket the daemon listens on
    ///
    /// # Errors
    ///
    /// Returns an error if no data directory can be determined
    pub fn socket_path(&self) -> Result<PathBuf> {
        match &self.socket_path {
            Some(path) => Ok(path.clone()),
            None => Ok(get_data_dir()?.join("screenguard.sock")),
        }
    }

    #[must_use]
    pub const fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            handler_timeout: Duration::from_millis(self.engine.handler_timeout_ms),
            history_capacity: self.engine.history_capacity,
        }
    }

    #[must_use]
    pub const fn session_options(&self) -> SessionOptions {
        SessionOptions {
            status_interval: Duration::from_millis(self.session.status_interval_ms),
            stop_timeout: Duration::from_millis(self.session.stop_timeout_ms),
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Default config file location
///
/// # Errors
///
/// Returns an error if the config directory cannot be determined.
pub fn default_path() -> Result<PathBuf> {
    let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Failed to get config dir"))?;
    path.push(APP_DIR);
    path.push("config.toml");
    Ok(path)
}

/// Get the local data directory for screenguard.
///
/// # Errors
///
/// Returns an error if the local data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    let mut path =
        dirs::data_local_dir().ok_or_else(|| anyhow::anyhow!("Failed to get local data dir"))?;
    path.push(APP_DIR);
    Ok(path)
}
