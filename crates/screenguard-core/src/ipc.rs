//! Unix-socket push transport
//!
//! One JSON object per line in both directions. A connection is bound to a user
//! by its first `hello` message. A user may hold several connections; closing
//! the last one has the same effect as a stop.

use anyhow::{Context, Result};
use chrono::Utc;
use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines},
    net::{
        unix::{OwnedReadHalf, OwnedWriteHalf},
        UnixListener, UnixStream,
    },
    sync::mpsc,
};

use crate::{
    error::TransportError,
    push::{ControlMessage, PushFrame, StatusUpdate},
    session_manager::DetectionSessionManager,
    settings::DetectionStatus,
};

const OUTBOUND_CAPACITY: usize = 64;

/// Bind the listening socket, replacing a stale one
///
/// # Errors
///
/// Returns an error if the socket directory cannot be created or the bind fails
pub fn bind(socket_path: &Path) -> io::Result<UnixListener> {
    if let Some(parent) = socket_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if socket_path.exists() {
        fs::remove_file(socket_path)?;
    }
    UnixListener::bind(socket_path)
}

/// Accept connections forever, one task per connection
pub async fn serve(listener: UnixListener, manager: Arc<DetectionSessionManager>) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, manager).await {
                        log::warn!("Push connection ended with error: {e}");
                    }
                });
            }
            Err(e) => {
                log::error!("IPC accept error: {e}");
            }
        }
    }
}

/// Reads newline-terminated control lines as raw bytes
///
/// Lines are not required to be UTF-8; decoding happens per message so a bad
/// line never ends the connection.
struct ControlReader {
    inner: BufReader<OwnedReadHalf>,
    buf: Vec<u8>,
}

impl ControlReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            inner: BufReader::new(reader),
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> io::Result<Option<&[u8]>> {
        self.buf.clear();
        if self.inner.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        Ok(Some(&self.buf))
    }
}

async fn handle_connection(
    stream: UnixStream,
    manager: Arc<DetectionSessionManager>,
) -> Result<(), TransportError> {
    let (reader, writer) = stream.into_split();
    let mut reader = ControlReader::new(reader);

    let Some(user_id) = read_hello(&mut reader).await? else {
        return Ok(());
    };

    let (tx, rx) = mpsc::channel::<PushFrame>(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(write_frames(writer, rx));
    let connection = match manager.attach_push(&user_id, Arc::new(tx.clone())).await {
        Ok(connection) => connection,
        Err(e) => {
            log::warn!("Rejected connection for {user_id:?}: {e}");
            return Ok(());
        }
    };
    log::info!("Push channel {connection} connected for {user_id}");

    let outcome = read_controls(&mut reader, &manager, &user_id, &tx).await;

    manager.disconnect(&user_id, connection).await;
    drop(tx);
    match writer_task.await {
        Ok(Ok(())) | Err(_) => {}
        Ok(Err(e)) => log::debug!("Push writer for {user_id} stopped: {e}"),
    }
    log::info!("Push channel {connection} disconnected for {user_id}");
    outcome
}

/// Wait for the `hello` that names the user; anything before it is ignored
async fn read_hello(reader: &mut ControlReader) -> Result<Option<String>, TransportError> {
    while let Some(line) = reader.next_line().await? {
        match ControlMessage::decode_bytes(line) {
            Ok(ControlMessage::Hello { user_id }) if !user_id.trim().is_empty() => {
                return Ok(Some(user_id));
            }
            Ok(other) => log::warn!("Ignoring {other:?} before hello"),
            Err(e) => log::warn!("Ignoring malformed message before hello: {e}"),
        }
    }
    Ok(None)
}

async fn read_controls(
    reader: &mut ControlReader,
    manager: &DetectionSessionManager,
    user_id: &str,
    tx: &mpsc::Sender<PushFrame>,
) -> Result<(), TransportError> {
    while let Some(line) = reader.next_line().await? {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let reply = match ControlMessage::decode_bytes(line) {
            Ok(message) => respond(manager, user_id, message).await,
            Err(e) => {
                log::warn!("Ignoring malformed control message from {user_id}: {e}");
                Some(PushFrame::Error {
                    message: e.to_string(),
                })
            }
        };
        if let Some(frame) = reply {
            tx.send(frame).await.map_err(|_| TransportError::Closed)?;
        }
    }
    Ok(())
}

/// Apply one control message and build the reply frame, if any
pub async fn respond(
    manager: &DetectionSessionManager,
    user_id: &str,
    message: ControlMessage,
) -> Option<PushFrame> {
    let result = match message {
        ControlMessage::Hello { .. } => {
            log::warn!("Ignoring repeated hello from {user_id}");
            return None;
        }
        ControlMessage::StartDetection => manager.start_detection(user_id).await.map(|_| None),
        ControlMessage::StopDetection => manager
            .stop_detection(user_id)
            .await
            .map(|_| Some(PushFrame::StatusUpdate(StatusUpdate::now(false)))),
        ControlMessage::UpdateConfig { config } => manager
            .update_config(user_id, &config)
            .await
            .map(|ack| Some(PushFrame::ConfigUpdated { ack })),
        ControlMessage::GetStatus => manager.get_status(user_id).await.map(|status| {
            Some(PushFrame::StatusSnapshot {
                status: Box::new(status),
            })
        }),
        ControlMessage::Ping { .. } => {
            return Some(PushFrame::Pong {
                timestamp: Utc::now(),
            })
        }
    };

    result.unwrap_or_else(|e| {
        log::warn!("Control message from {user_id} failed: {e}");
        Some(PushFrame::Error {
            message: e.to_string(),
        })
    })
}

async fn write_frames(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<PushFrame>,
) -> Result<(), TransportError> {
    while let Some(frame) = rx.recv().await {
        let mut line = serde_json::to_string(&frame)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
    }
    writer.shutdown().await?;
    Ok(())
}

/// Client side of the push transport
pub struct PushClient {
    socket_path: PathBuf,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl PushClient {
    /// Connect and identify as `user_id`
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is not listening on `socket_path`
    pub async fn connect(socket_path: &Path, user_id: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("failed to connect to {}", socket_path.display()))?;
        let (reader, writer) = stream.into_split();
        let mut client = Self {
            socket_path: socket_path.to_path_buf(),
            lines: BufReader::new(reader).lines(),
            writer,
        };
        client
            .send(&ControlMessage::Hello {
                user_id: user_id.to_string(),
            })
            .await?;
        Ok(client)
    }

    #[must_use]
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// # Errors
    ///
    /// Returns an error if the connection is gone
    pub async fn send(&mut self, message: &ControlMessage) -> Result<()> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .await
            .context("failed to send control message")?;
        Ok(())
    }

    /// Next frame from the daemon; `None` once the connection is closed
    ///
    /// # Errors
    ///
    /// Returns an error on I/O failure or an undecodable frame
    pub async fn next_frame(&mut self) -> Result<Option<PushFrame>> {
        match self.lines.next_line().await? {
            Some(line) => Ok(Some(
                serde_json::from_str(&line).context("daemon sent an invalid frame")?,
            )),
            None => Ok(None),
        }
    }

    /// Ask for a status snapshot, skipping unrelated frames
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon reports one or the connection closes first
    pub async fn request_status(&mut self) -> Result<DetectionStatus> {
        self.send(&ControlMessage::GetStatus).await?;
        loop {
            match self.next_frame().await? {
                Some(PushFrame::StatusSnapshot { status }) => return Ok(*status),
                Some(PushFrame::Error { message }) => anyhow::bail!("daemon error: {message}"),
                Some(_) => {}
                None => anyhow::bail!("daemon closed the connection"),
            }
        }
    }

    /// Close the write side, which the daemon treats as a disconnect
    ///
    /// # Errors
    ///
    /// Returns an error if the shutdown fails
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        session_manager::SessionOptions,
        settings::{ConfigUpdate, SessionState},
    };
    use screenguard_alerts::AlertDispatchEngine;
    use screenguard_detector::{ChannelSourceRegistry, FaceObservation, GazeAngles, SourceFrame};
    use std::time::Duration;

    async fn next_where(client: &mut PushClient, matches: impl Fn(&PushFrame) -> bool) -> PushFrame {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let frame = client.next_frame().await.unwrap().expect("connection closed");
                if matches(&frame) {
                    return frame;
                }
            }
        })
        .await
        .expect("timed out waiting for frame")
    }

    async fn start_server(
        registry: Arc<ChannelSourceRegistry>,
    ) -> (tempfile::TempDir, PathBuf, Arc<DetectionSessionManager>) {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("screenguard.sock");
        let manager = Arc::new(DetectionSessionManager::new(
            Arc::new(AlertDispatchEngine::with_defaults()),
            registry,
            SessionOptions {
                status_interval: Duration::from_millis(20),
                stop_timeout: Duration::from_secs(1),
            },
        ));
        let listener = bind(&socket_path).unwrap();
        tokio::spawn(serve(listener, Arc::clone(&manager)));
        (dir, socket_path, manager)
    }

    #[tokio::test]
    async fn test_detection_over_socket() {
        let registry = Arc::new(ChannelSourceRegistry::new(8));
        let frames = registry.register("alice").await;
        let (_dir, socket_path, manager) = start_server(registry).await;

        let mut client = PushClient::connect(&socket_path, "alice").await.unwrap();
        client.send(&ControlMessage::StartDetection).await.unwrap();
        next_where(&mut client, |frame| {
            matches!(frame, PushFrame::StatusUpdate(update) if update.is_active)
        })
        .await;

        frames
            .send(SourceFrame::Faces {
                faces: vec![FaceObservation {
                    angles: GazeAngles::new(3.0, -4.0),
                    detection_confidence: 0.92,
                }],
                timestamp: None,
            })
            .await
            .unwrap();
        let frame = next_where(&mut client, |frame| {
            matches!(frame, PushFrame::DetectionUpdate(_))
        })
        .await;
        assert!(matches!(frame, PushFrame::DetectionUpdate(update) if update.is_peeking));

        let status = client.request_status().await.unwrap();
        assert_eq!(status.state, SessionState::Running);
        assert_eq!(status.frames_processed, 1);
        assert_eq!(status.alert_stats.total_alerts, 3);

        client.send(&ControlMessage::StopDetection).await.unwrap();
        next_where(&mut client, |frame| {
            matches!(frame, PushFrame::StatusUpdate(update) if !update.is_active)
        })
        .await;
        assert!(manager.active_users().await.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_message_is_ignored() {
        let (_dir, socket_path, _manager) =
            start_server(Arc::new(ChannelSourceRegistry::new(8))).await;

        let mut client = PushClient::connect(&socket_path, "bob").await.unwrap();
        client
            .writer
            .write_all(b"{\"type\":\"self_destruct\"}\n")
            .await
            .unwrap();
        let frame = next_where(&mut client, |frame| matches!(frame, PushFrame::Error { .. })).await;
        assert!(matches!(frame, PushFrame::Error { .. }));

        client
            .send(&ControlMessage::Ping { timestamp: None })
            .await
            .unwrap();
        next_where(&mut client, |frame| matches!(frame, PushFrame::Pong { .. })).await;

        client
            .send(&ControlMessage::UpdateConfig {
                config: ConfigUpdate {
                    alert_floor: Some(0.95),
                    ..ConfigUpdate::default()
                },
            })
            .await
            .unwrap();
        let frame = next_where(&mut client, |frame| {
            matches!(frame, PushFrame::ConfigUpdated { .. })
        })
        .await;
        match frame {
            PushFrame::ConfigUpdated { ack } => {
                assert!((ack.settings.alert_floor - 0.95).abs() < f64::EPSILON);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_start_failure_is_reported_as_error_frame() {
        let (_dir, socket_path, _manager) =
            start_server(Arc::new(ChannelSourceRegistry::new(8))).await;

        let mut client = PushClient::connect(&socket_path, "carol").await.unwrap();
        client.send(&ControlMessage::StartDetection).await.unwrap();
        let frame = next_where(&mut client, |frame| matches!(frame, PushFrame::Error { .. })).await;
        assert!(matches!(frame, PushFrame::Error { message } if message.contains("carol")));
    }

    #[tokio::test]
    async fn test_invalid_utf8_line_keeps_session_running() {
        let registry = Arc::new(ChannelSourceRegistry::new(8));
        let _frames = registry.register("zed").await;
        let (_dir, socket_path, manager) = start_server(registry).await;

        let mut client = PushClient::connect(&socket_path, "zed").await.unwrap();
        client.send(&ControlMessage::StartDetection).await.unwrap();
        next_where(&mut client, |frame| matches!(frame, PushFrame::StatusUpdate(_))).await;

        client.writer.write_all(b"\xff\xfe garbage\n").await.unwrap();
        next_where(&mut client, |frame| matches!(frame, PushFrame::Error { .. })).await;

        assert_eq!(manager.active_users().await, vec!["zed".to_string()]);
        let status = client.request_status().await.unwrap();
        assert_eq!(status.state, SessionState::Running);
    }

    #[tokio::test]
    async fn test_second_connection_survives_first_closing() {
        let registry = Arc::new(ChannelSourceRegistry::new(8));
        let _frames = registry.register("amy").await;
        let (_dir, socket_path, _manager) = start_server(registry).await;

        let mut first = PushClient::connect(&socket_path, "amy").await.unwrap();
        let mut second = PushClient::connect(&socket_path, "amy").await.unwrap();
        for client in [&mut first, &mut second] {
            client.send(&ControlMessage::Ping { timestamp: None }).await.unwrap();
            next_where(client, |frame| matches!(frame, PushFrame::Pong { .. })).await;
        }

        first.close().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        second.send(&ControlMessage::StartDetection).await.unwrap();
        next_where(&mut second, |frame| {
            matches!(frame, PushFrame::StatusUpdate(update) if update.is_active)
        })
        .await;
    }

    #[tokio::test]
    async fn test_closing_connection_stops_detection() {
        let registry = Arc::new(ChannelSourceRegistry::new(8));
        let _frames = registry.register("dave").await;
        let (_dir, socket_path, manager) = start_server(registry).await;

        let mut client = PushClient::connect(&socket_path, "dave").await.unwrap();
        client.send(&ControlMessage::StartDetection).await.unwrap();
        next_where(&mut client, |frame| matches!(frame, PushFrame::StatusUpdate(_))).await;
        assert_eq!(manager.active_users().await, vec!["dave".to_string()]);

        client.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !manager.active_users().await.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            manager.get_status("dave").await.unwrap().state,
            SessionState::Idle
        );
    }
}
