use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{AlertEvent, AlertLevel, Channel};

/// Aggregate view over the alert history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total_alerts: usize,
    pub by_channel: BTreeMap<Channel, usize>,
    pub by_level: BTreeMap<AlertLevel, usize>,
    pub average_confidence: f64,
    pub count_in_last_hour: usize,
}

impl AlertStats {
    /// Aggregate `events`, counting those newer than one hour before `now`
    #[must_use]
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a AlertEvent>, now: DateTime<Utc>) -> Self {
        let one_hour_ago = now - Duration::hours(1);
        let mut stats = Self::default();
        let mut confidence_sum = 0.0;

        for event in events {
            stats.total_alerts += 1;
            *stats.by_channel.entry(event.channel).or_insert(0) += 1;
            *stats.by_level.entry(event.level).or_insert(0) += 1;
            confidence_sum += event.confidence;
            if event.timestamp > one_hour_ago {
                stats.count_in_last_hour += 1;
            }
        }

        if stats.total_alerts > 0 {
            #[allow(clippy::cast_precision_loss)]
            let total = stats.total_alerts as f64;
            stats.average_confidence = confidence_sum / total;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Metadata;

    fn event(channel: Channel, level: AlertLevel, confidence: f64, age_minutes: i64) -> AlertEvent {
        AlertEvent {
            alert_id: uuid::Uuid::new_v4().to_string(),
            user_id: "alice".to_string(),
            channel,
            level,
            message: "peek".to_string(),
            confidence,
            timestamp: Utc::now() - Duration::minutes(age_minutes),
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_empty_stats() {
        let stats = AlertStats::from_events(&[], Utc::now());
        assert_eq!(stats, AlertStats::default());
        assert!(stats.average_confidence.abs() < f64::EPSILON);
    }

    #[test]
    fn test_counts_and_average() {
        let events = vec![
            event(Channel::Visual, AlertLevel::Medium, 0.8, 5),
            event(Channel::Visual, AlertLevel::High, 0.9, 10),
            event(Channel::Audio, AlertLevel::Medium, 1.0, 120),
        ];
        let stats = AlertStats::from_events(&events, Utc::now());

        assert_eq!(stats.total_alerts, 3);
        assert_eq!(stats.by_channel.get(&Channel::Visual), Some(&2));
        assert_eq!(stats.by_channel.get(&Channel::Audio), Some(&1));
        assert_eq!(stats.by_level.get(&AlertLevel::Medium), Some(&2));
        assert_eq!(stats.count_in_last_hour, 2);
        assert!((stats.average_confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_stats_json_uses_channel_names() {
        let events = vec![event(Channel::Haptic, AlertLevel::Low, 0.7, 1)];
        let json = serde_json::to_value(AlertStats::from_events(&events, Utc::now())).unwrap();
        assert_eq!(json["by_channel"]["haptic"], 1);
        assert_eq!(json["by_level"]["low"], 1);
    }
}
