//! Session status command

use anyhow::{Context, Result};
use screenguard_alerts::AlertStats;
use screenguard_core::{DetectionStatus, PushClient, ScreenGuardConfig};
use tabled::{Table, Tabled};

use super::helpers::{format_confidence, format_time, yes_no};

#[derive(Tabled)]
struct AlertCountRow {
    #[tabled(rename = "Breakdown")]
    kind: &'static str,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Alerts")]
    count: usize,
}

fn alert_rows(stats: &AlertStats) -> Vec<AlertCountRow> {
    let channels = stats.by_channel.iter().map(|(channel, count)| AlertCountRow {
        kind: "channel",
        name: channel.to_string(),
        count: *count,
    });
    let levels = stats.by_level.iter().map(|(level, count)| AlertCountRow {
        kind: "level",
        name: level.to_string(),
        count: *count,
    });
    channels.chain(levels).collect()
}

pub async fn show_status(config: &ScreenGuardConfig, user: &str) -> Result<()> {
    let socket_path = config.socket_path()?;
    let mut client = PushClient::connect(&socket_path, user)
        .await
        .context("daemon is not running (start it with `screenguard serve`)")?;
    let status = client.request_status().await?;
    client.close().await?;

    print_status(&status);
    Ok(())
}

fn print_status(status: &DetectionStatus) {
    println!("User:             {}", status.user_id);
    println!("State:            {}", status.state);
    println!("Active:           {}", yes_no(status.is_active));
    println!("Started:          {}", format_time(status.started_at));
    println!("Last status:      {}", format_time(status.last_status_at));
    println!("Frames processed: {}", status.frames_processed);
    println!("Alerts raised:    {}", status.alerts_dispatched);

    if let Some(signal) = &status.last_signal {
        println!(
            "Last signal:      {} face(s), peeking: {}, confidence {} at {}",
            signal.face_count,
            yes_no(signal.is_peeking),
            format_confidence(signal.confidence),
            format_time(Some(signal.timestamp))
        );
    }

    let stats = &status.alert_stats;
    if stats.total_alerts == 0 {
        println!("\nNo alerts recorded.");
        return;
    }

    let table = Table::new(alert_rows(stats)).to_string();
    println!("\n{table}");
    println!(
        "\nTotal alerts: {} ({} in the last hour), average confidence {}",
        stats.total_alerts,
        stats.count_in_last_hour,
        format_confidence(stats.average_confidence)
    );
}
