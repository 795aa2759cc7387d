//! Live detection feed for one user

use anyhow::{Context, Result};
use screenguard_core::{ControlMessage, PushClient, PushFrame, ScreenGuardConfig};
use std::time::Duration;

use super::helpers::{format_confidence, format_time, yes_no};

const STOP_ACK_TIMEOUT: Duration = Duration::from_secs(3);

pub async fn watch_user(config: &ScreenGuardConfig, user: &str, json: bool) -> Result<()> {
    let socket_path = config.socket_path()?;
    let mut client = PushClient::connect(&socket_path, user)
        .await
        .context("daemon is not running (start it with `screenguard serve`)")?;
    client.send(&ControlMessage::StartDetection).await?;
    log::info!("Watching {user}, press Ctrl-C to stop");

    loop {
        tokio::select! {
            frame = client.next_frame() => {
                let Some(frame) = frame? else {
                    println!("Daemon closed the connection");
                    return Ok(());
                };
                print_frame(&frame, json)?;
            }
            _ = tokio::signal::ctrl_c() => {
                break;
            }
        }
    }

    client.send(&ControlMessage::StopDetection).await?;
    let acknowledged = tokio::time::timeout(STOP_ACK_TIMEOUT, async {
        while let Some(frame) = client.next_frame().await? {
            if matches!(frame, PushFrame::StatusUpdate(update) if !update.is_active) {
                return Ok::<bool, anyhow::Error>(true);
            }
        }
        Ok(false)
    })
    .await;
    match acknowledged {
        Ok(Ok(true)) => println!("Detection stopped"),
        Ok(Ok(false)) => println!("Daemon closed the connection"),
        Ok(Err(e)) => return Err(e),
        Err(_) => log::warn!("No stop acknowledgement within {STOP_ACK_TIMEOUT:?}"),
    }
    client.close().await
}

fn print_frame(frame: &PushFrame, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(frame)?);
        return Ok(());
    }
    if let Some(line) = describe(frame) {
        println!("{line}");
    }
    Ok(())
}

fn describe(frame: &PushFrame) -> Option<String> {
    match frame {
        PushFrame::DetectionUpdate(update) => Some(format!(
            "{} peeking: {:<3} confidence: {}",
            format_time(Some(update.timestamp)),
            yes_no(update.is_peeking),
            format_confidence(update.confidence)
        )),
        PushFrame::StatusUpdate(update) if !update.is_active => Some(format!(
            "{} detection stopped",
            format_time(Some(update.timestamp))
        )),
        PushFrame::Error { message } => Some(format!("error: {message}")),
        PushFrame::StatusUpdate(_)
        | PushFrame::StatusSnapshot { .. }
        | PushFrame::ConfigUpdated { .. }
        | PushFrame::Pong { .. } => None,
    }
}
