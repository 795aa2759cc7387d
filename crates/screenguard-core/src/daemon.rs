use crate::{
    config::ScreenGuardConfig,
    ipc::{bind, serve},
    session_manager::DetectionSessionManager,
};
use anyhow::{Context, Result};
use screenguard_alerts::{AlertDispatchEngine, Channel, LogHandler, WebhookHandler};
use screenguard_detector::{IdleSource, ReplaySource, ReplaySourceFactory, SignalSourceFactory};
use std::{fs, path::PathBuf, sync::Arc, time::Duration};

pub struct Daemon {
    manager: Arc<DetectionSessionManager>,
    socket_path: PathBuf,
}

impl Daemon {
    /// Build the engine and session manager described by `config`
    ///
    /// # Errors
    ///
    /// Returns an error if a channel configuration is rejected, the webhook URL is
    /// invalid, or the replay file cannot be loaded
    pub async fn new(config: &ScreenGuardConfig) -> Result<Self> {
        let engine = Arc::new(build_engine(config).await?);
        let sources = build_sources(config)?;
        let manager = DetectionSessionManager::new(engine, sources, config.session_options())
            .with_default_settings(config.detection.clone());

        Ok(Self {
            manager: Arc::new(manager),
            socket_path: config.socket_path()?,
        })
    }

    #[must_use]
    pub const fn manager(&self) -> &Arc<DetectionSessionManager> {
        &self.manager
    }

    /// Serve push connections until Ctrl-C, then stop every session
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound
    pub async fn run_with_signals(&self) -> Result<()> {
        let listener = bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        let server = tokio::spawn(serve(listener, Arc::clone(&self.manager)));
        log::info!(
            "Daemon listening on {} with signal handling",
            self.socket_path.display()
        );

        match tokio::signal::ctrl_c().await {
            Ok(()) => log::info!("Received Ctrl-C, shutting down..."),
            Err(e) => log::error!("Failed to wait for Ctrl-C: {e}"),
        }

        server.abort();
        self.manager.shutdown().await;
        if let Err(e) = fs::remove_file(&self.socket_path) {
            log::debug!("Socket cleanup skipped: {e}");
        }
        log::info!("Daemon shut down gracefully.");
        Ok(())
    }
}

async fn build_engine(config: &ScreenGuardConfig) -> Result<AlertDispatchEngine> {
    let engine = AlertDispatchEngine::new(config.engine_options());
    for channel_config in &config.channels {
        engine
            .configure(channel_config.channel, channel_config.clone())
            .await
            .with_context(|| format!("invalid configuration for channel {}", channel_config.channel))?;
    }

    let log_handler = Arc::new(LogHandler);
    for channel in Channel::ALL {
        engine.register_handler(channel, log_handler.clone()).await;
    }

    if let Some(webhook) = &config.webhook {
        let handler = Arc::new(WebhookHandler::new(webhook.url.clone(), webhook.max_attempts)?);
        for channel in &webhook.channels {
            engine.register_handler(*channel, handler.clone()).await;
        }
        log::info!("Forwarding {:?} alerts to {}", webhook.channels, webhook.url);
    }
    Ok(engine)
}

fn build_sources(config: &ScreenGuardConfig) -> Result<Arc<dyn SignalSourceFactory>> {
    let Some(replay) = &config.replay else {
        log::info!("No replay configured, sessions will only report liveness");
        return Ok(Arc::new(IdleSource));
    };

    let frames = ReplaySource::load(&replay.path)?;
    log::info!(
        "Replaying {} frames from {}",
        frames.len(),
        replay.path.display()
    );
    Ok(Arc::new(ReplaySourceFactory::new(
        frames,
        Duration::from_millis(replay.pace_ms),
        replay.looping,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{ReplaySection, WebhookSection},
        ipc::PushClient,
        push::{ControlMessage, PushFrame},
    };
    use screenguard_alerts::ChannelConfig;

    #[tokio::test]
    async fn test_daemon_applies_channel_overrides() {
        let config = ScreenGuardConfig {
            channels: vec![ChannelConfig::new(Channel::Email).with_threshold(0.95)],
            webhook: Some(WebhookSection {
                url: "http://127.0.0.1:9/alerts".into(),
                channels: vec![Channel::Notification],
                max_attempts: 1,
            }),
            ..ScreenGuardConfig::default()
        };
        let daemon = Daemon::new(&config).await.unwrap();
        let engine = daemon.manager().engine();

        let email = engine.channel_config(Channel::Email).await.unwrap();
        assert!((email.threshold - 0.95).abs() < f64::EPSILON);
        assert!(engine.channel_config(Channel::Visual).await.is_some());
        assert_eq!(engine.handler_count(Channel::Notification).await, 2);
        assert_eq!(engine.handler_count(Channel::Visual).await, 1);
    }

    #[tokio::test]
    async fn test_missing_replay_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let config = ScreenGuardConfig {
            replay: Some(ReplaySection {
                path: dir.path().join("absent.jsonl"),
                pace_ms: 10,
                looping: false,
            }),
            ..ScreenGuardConfig::default()
        };
        assert!(Daemon::new(&config).await.is_err());
    }

    #[tokio::test]
    async fn test_replay_frames_reach_client() {
        let dir = tempfile::tempdir().unwrap();
        let replay_path = dir.path().join("frames.jsonl");
        fs::write(
            &replay_path,
            r#"{"kind":"faces","faces":[{"angles":{"pitch":2.0,"yaw":1.0},"detection_confidence":0.9}]}"#,
        )
        .unwrap();
        let socket_path = dir.path().join("daemon.sock");
        let config = ScreenGuardConfig {
            socket_path: Some(socket_path.clone()),
            replay: Some(ReplaySection {
                path: replay_path,
                pace_ms: 10,
                looping: true,
            }),
            ..ScreenGuardConfig::default()
        };
        let daemon = Daemon::new(&config).await.unwrap();
        let listener = bind(&socket_path).unwrap();
        tokio::spawn(serve(listener, Arc::clone(daemon.manager())));

        let mut client = PushClient::connect(&socket_path, "erin").await.unwrap();
        client.send(&ControlMessage::StartDetection).await.unwrap();
        let update = tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                if let Some(PushFrame::DetectionUpdate(update)) = client.next_frame().await.unwrap() {
                    return update;
                }
            }
        })
        .await
        .unwrap();
        assert!(update.is_peeking);
        assert!((update.confidence - 0.9).abs() < 1e-9);
    }
}
