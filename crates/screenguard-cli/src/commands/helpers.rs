//! Helper utility functions for CLI commands

use chrono::{DateTime, Local, Utc};

/// Local wall-clock time, or a dash when absent
pub fn format_time(timestamp: Option<DateTime<Utc>>) -> String {
    timestamp.map_or_else(
        || "-".to_string(),
        |ts| ts.with_timezone(&Local).format("%H:%M:%S").to_string(),
    )
}

pub fn format_confidence(confidence: f64) -> String {
    format!("{:.0}%", confidence * 100.0)
}

pub fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_time_absent() {
        assert_eq!(format_time(None), "-");
    }

    #[test]
    fn test_format_time_present() {
        let formatted = format_time(Some(Utc::now()));
        assert_eq!(formatted.len(), 8);
        assert_eq!(formatted.matches(':').count(), 2);
    }

    #[test]
    fn test_format_confidence() {
        assert_eq!(format_confidence(0.873), "87%");
        assert_eq!(format_confidence(1.0), "100%");
        assert_eq!(format_confidence(0.0), "0%");
    }
}
