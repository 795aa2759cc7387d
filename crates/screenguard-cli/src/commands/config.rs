//! Configuration display

use anyhow::Result;
use screenguard_alerts::{Channel, ChannelConfig};
use screenguard_core::{config::default_path, ScreenGuardConfig};
use std::collections::BTreeMap;
use tabled::{Table, Tabled};

use super::helpers::yes_no;

#[derive(Tabled)]
struct ChannelRow {
    #[tabled(rename = "Channel")]
    channel: String,
    #[tabled(rename = "Enabled")]
    enabled: &'static str,
    #[tabled(rename = "Threshold")]
    threshold: String,
    #[tabled(rename = "Cooldown (s)")]
    cooldown: u64,
    #[tabled(rename = "Max / window")]
    rate: String,
}

impl From<&ChannelConfig> for ChannelRow {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            channel: config.channel.to_string(),
            enabled: yes_no(config.enabled),
            threshold: format!("{:.2}", config.threshold),
            cooldown: config.cooldown_seconds,
            rate: format!("{} / {}s", config.max_per_minute, config.window_seconds),
        }
    }
}

/// Built-in channel configurations with the file's overrides applied
fn effective_channels(config: &ScreenGuardConfig) -> Vec<ChannelConfig> {
    let mut channels: BTreeMap<Channel, ChannelConfig> = ChannelConfig::builtin_defaults()
        .into_iter()
        .map(|config| (config.channel, config))
        .collect();
    for config in &config.channels {
        channels.insert(config.channel, config.clone());
    }
    channels.into_values().collect()
}

pub fn show_config(config: &ScreenGuardConfig) -> Result<()> {
    println!("# {}", default_path()?.display());
    println!("socket: {}\n", config.socket_path()?.display());
    println!("{}", config.to_toml()?);

    let channels = effective_channels(config);
    let rows: Vec<ChannelRow> = channels.iter().map(ChannelRow::from).collect();
    println!("{}", Table::new(rows));

    let unconfigured: Vec<String> = Channel::ALL
        .into_iter()
        .filter(|channel| !channels.iter().any(|c| c.channel == *channel))
        .map(|channel| channel.to_string())
        .collect();
    if !unconfigured.is_empty() {
        println!("\nUnconfigured channels: {}", unconfigured.join(", "));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_replace_builtin_defaults() {
        let config = ScreenGuardConfig {
            channels: vec![
                ChannelConfig::new(Channel::Visual).with_threshold(0.9),
                ChannelConfig::new(Channel::Email),
            ],
            ..ScreenGuardConfig::default()
        };

        let channels = effective_channels(&config);
        let visual = channels.iter().find(|c| c.channel == Channel::Visual).unwrap();
        assert!((visual.threshold - 0.9).abs() < f64::EPSILON);
        assert!(channels.iter().any(|c| c.channel == Channel::Email));
        assert!(!channels.iter().any(|c| c.channel == Channel::Sms));
    }

    #[test]
    fn test_channel_row_formatting() {
        let row = ChannelRow::from(&ChannelConfig::new(Channel::Audio).with_enabled(false));
        assert_eq!(row.channel, "audio");
        assert_eq!(row.enabled, "no");
        assert_eq!(row.threshold, "0.70");
        assert_eq!(row.rate, "10 / 60s");
    }
}
