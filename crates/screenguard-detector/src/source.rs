//! Signal sources feeding the per-user sampling loop.
//!
//! Image acquisition and landmark extraction live outside this workspace; a source
//! only hands over what that pipeline produced, one frame at a time.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::Instant,
};

use crate::signal::SourceFrame;

/// Producer of detection frames for one user
///
/// `next_frame` is polled inside a `select!` next to other branches, so
/// implementations must be cancel-safe: dropping the future before it completes
/// must not lose a frame.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Wait for the next frame. `Ok(None)` means the source is exhausted.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying detector failed
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Opens a signal source when a user's session starts
#[async_trait]
pub trait SignalSourceFactory: Send + Sync {
    /// # Errors
    ///
    /// Returns an error if no source can be opened for the user
    async fn open(&self, user_id: &str) -> Result<Box<dyn SignalSource>>;
}

/// Source that never produces a frame; the loop only reports liveness
#[derive(Debug, Default, Clone, Copy)]
pub struct IdleSource;

#[async_trait]
impl SignalSource for IdleSource {
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        std::future::pending::<()>().await;
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "idle"
    }
}

#[async_trait]
impl SignalSourceFactory for IdleSource {
    async fn open(&self, _user_id: &str) -> Result<Box<dyn SignalSource>> {
        Ok(Box::new(Self))
    }
}

/// Source backed by a tokio mpsc channel
///
/// The receiver is shared so a user's frames survive a stop/start cycle.
pub struct ChannelSource {
    rx: Arc<Mutex<mpsc::Receiver<SourceFrame>>>,
}

impl ChannelSource {
    /// Create a connected sender/source pair
    #[must_use]
    pub fn pair(capacity: usize) -> (mpsc::Sender<SourceFrame>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            tx,
            Self {
                rx: Arc::new(Mutex::new(rx)),
            },
        )
    }
}

#[async_trait]
impl SignalSource for ChannelSource {
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        let mut rx = self.rx.lock().await;
        Ok(rx.recv().await)
    }

    fn name(&self) -> &'static str {
        "channel"
    }
}

/// Per-user registry of channel sources
pub struct ChannelSourceRegistry {
    receivers: Mutex<HashMap<String, Arc<Mutex<mpsc::Receiver<SourceFrame>>>>>,
    capacity: usize,
}

impl ChannelSourceRegistry {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            receivers: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Register (or replace) the frame feed for a user and return its sender
    pub async fn register(&self, user_id: &str) -> mpsc::Sender<SourceFrame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.receivers
            .lock()
            .await
            .insert(user_id.to_string(), Arc::new(Mutex::new(rx)));
        log::debug!("Registered frame feed for user {user_id}");
        tx
    }
}

#[async_trait]
impl SignalSourceFactory for ChannelSourceRegistry {
    async fn open(&self, user_id: &str) -> Result<Box<dyn SignalSource>> {
        let receivers = self.receivers.lock().await;
        let rx = receivers
            .get(user_id)
            .cloned()
            .with_context(|| format!("no frame feed registered for user {user_id}"))?;
        Ok(Box::new(ChannelSource { rx }))
    }
}

/// Source replaying recorded frames at a fixed pace
pub struct ReplaySource {
    frames: Arc<[SourceFrame]>,
    index: usize,
    pace: Duration,
    looping: bool,
    next_at: Option<Instant>,
}

impl ReplaySource {
    #[must_use]
    pub fn new(frames: Arc<[SourceFrame]>, pace: Duration, looping: bool) -> Self {
        Self {
            frames,
            index: 0,
            pace,
            looping,
            next_at: None,
        }
    }

    /// Parse a JSON-lines recording, one `SourceFrame` per non-empty line
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or a line is not a valid frame
    pub fn load(path: &Path) -> Result<Vec<SourceFrame>> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        parse_frames(&content)
            .with_context(|| format!("invalid replay file {}", path.display()))
    }
}

/// Parse JSON-lines frames
///
/// # Errors
///
/// Returns an error naming the first line that fails to parse
pub fn parse_frames(content: &str) -> Result<Vec<SourceFrame>> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str::<SourceFrame>(line).with_context(|| format!("line {}", number + 1))
        })
        .collect()
}

#[async_trait]
impl SignalSource for ReplaySource {
    async fn next_frame(&mut self) -> Result<Option<SourceFrame>> {
        if self.index >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return Ok(None);
            }
            self.index = 0;
        }

        // Deadline is stored before sleeping so a dropped poll resumes the same wait.
        let deadline = *self.next_at.get_or_insert_with(Instant::now);
        tokio::time::sleep_until(deadline).await;
        self.next_at = Some(deadline + self.pace);

        let frame = self.frames[self.index].clone().restamped(Utc::now());
        self.index += 1;
        Ok(Some(frame))
    }

    fn name(&self) -> &'static str {
        "replay"
    }
}

/// Hands every user their own replay of the same recording
pub struct ReplaySourceFactory {
    frames: Arc<[SourceFrame]>,
    pace: Duration,
    looping: bool,
}

impl ReplaySourceFactory {
    #[must_use]
    pub fn new(frames: Vec<SourceFrame>, pace: Duration, looping: bool) -> Self {
        Self {
            frames: frames.into(),
            pace,
            looping,
        }
    }
}

#[async_trait]
impl SignalSourceFactory for ReplaySourceFactory {
    async fn open(&self, user_id: &str) -> Result<Box<dyn SignalSource>> {
        log::debug!(
            "Opening replay of {} frames for user {user_id}",
            self.frames.len()
        );
        Ok(Box::new(ReplaySource::new(
            Arc::clone(&self.frames),
            self.pace,
            self.looping,
        )))
    }
}
