//! Per-user detection sessions
//!
//! Each user owns one `Session` record in the manager's arena. A running session
//! has exactly one sampling task, started and stopped under the session's
//! lifecycle lock and cancelled through a `CancellationToken`.

use chrono::{DateTime, Utc};
use screenguard_alerts::{validate_user_id, AlertDispatchEngine, AlertRequest, ChannelConfig};
use screenguard_detector::{DetectionSignal, SignalSource, SignalSourceFactory, SourceFrame};
use serde_json::json;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    error::{SessionError, TransportError},
    push::{DetectionUpdate, PushFrame, PushSink, StatusUpdate},
    settings::{ConfigAck, ConfigUpdate, DetectionSettings, DetectionStatus, SessionState},
};


/// Identifies one attached push channel
pub type ConnectionId = u64;

const MIN_STATUS_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Cadence of `status_update` frames while a session runs
    pub status_interval: Duration,
    /// How long `stop_detection` waits for the loop before aborting it
    pub stop_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(1),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SessionSnapshot {
    state: SessionState,
    last_signal: Option<DetectionSignal>,
    last_status_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    frames_processed: u64,
    alerts_dispatched: u64,
}

struct RunningLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct Lifecycle {
    running: Option<RunningLoop>,
    /// Set once the record has left the arena; callers holding it must look up the live one
    released: bool,
}

type Sinks = BTreeMap<ConnectionId, Arc<dyn PushSink>>;

struct Session {
    user_id: String,
    lifecycle: Mutex<Lifecycle>,
    snapshot: watch::Sender<SessionSnapshot>,
    settings: watch::Sender<DetectionSettings>,
    sinks: watch::Sender<Sinks>,
}

impl Session {
    fn new(user_id: &str, settings: DetectionSettings) -> Self {
        Self {
            user_id: user_id.to_string(),
            lifecycle: Mutex::new(Lifecycle::default()),
            snapshot: watch::channel(SessionSnapshot::default()).0,
            settings: watch::channel(settings).0,
            sinks: watch::channel(Sinks::new()).0,
        }
    }

    fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    fn set_state(&self, state: SessionState) {
        self.snapshot.send_modify(|snapshot| snapshot.state = state);
    }

    /// Deliver a frame to every attached sink
    ///
    /// A failing sink is detached. The push only fails once the last sink is gone;
    /// with nothing attached frames are dropped.
    async fn push(&self, frame: PushFrame) -> Result<(), TransportError> {
        let sinks: Vec<(ConnectionId, Arc<dyn PushSink>)> = self
            .sinks
            .borrow()
            .iter()
            .map(|(id, sink)| (*id, Arc::clone(sink)))
            .collect();

        let mut failure = None;
        for (connection, sink) in sinks {
            if let Err(err) = sink.push(frame.clone()).await {
                log::debug!("Dropping push channel {connection} for {}: {err}", self.user_id);
                self.sinks.send_modify(|sinks| {
                    sinks.remove(&connection);
                });
                failure = Some(err);
            }
        }

        match failure {
            Some(err) if self.sinks.borrow().is_empty() => Err(err),
            _ => Ok(()),
        }
    }

    /// Leave `Running` on the loop's own account and optionally send the terminal status frame
    async fn finish(&self, timeout: Duration, notify: bool) {
        self.snapshot.send_modify(|snapshot| {
            if snapshot.state == SessionState::Running {
                snapshot.state = SessionState::Stopped;
            }
        });
        if !notify {
            return;
        }

        let terminal = PushFrame::StatusUpdate(StatusUpdate::now(false));
        match tokio::time::timeout(timeout, self.push(terminal)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::debug!("Terminal status for {} not delivered: {err}", self.user_id),
            Err(_) => log::warn!("Terminal status for {} timed out", self.user_id),
        }
    }
}

enum LoopExit {
    Cancelled,
    Exhausted,
    Fault(anyhow::Error),
    Disconnected(TransportError),
}

enum Wake {
    Status,
    Frame(anyhow::Result<Option<SourceFrame>>),
}

/// Aborts the wrapped task when dropped
struct AbortOnDrop(JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// The sampling task of one running session
struct SamplingLoop {
    session: Arc<Session>,
    engine: Arc<AlertDispatchEngine>,
    source: Box<dyn SignalSource>,
    cancel: CancellationToken,
    options: SessionOptions,
}

impl SamplingLoop {
    /// Run the loop in its own task so a panic still ends the session properly
    async fn supervise(self) {
        let session = Arc::clone(&self.session);
        let stop_timeout = self.options.stop_timeout;

        let mut worker = AbortOnDrop(tokio::spawn(self.run()));
        if let Err(err) = (&mut worker.0).await {
            if err.is_panic() {
                log::error!("Detection loop for {} panicked", session.user_id);
                session.finish(stop_timeout, true).await;
            }
        }
    }

    async fn run(mut self) {
        let exit = self.sample().await;
        let user_id = self.session.user_id.clone();
        let stop_timeout = self.options.stop_timeout;

        match exit {
            LoopExit::Cancelled => log::debug!("Detection loop for {user_id} cancelled"),
            LoopExit::Exhausted => {
                log::info!("Signal source '{}' for {user_id} is exhausted", self.source.name());
                self.session.finish(stop_timeout, true).await;
            }
            LoopExit::Fault(err) => {
                log::error!("Detection loop for {user_id} failed: {err:#}");
                self.session.finish(stop_timeout, true).await;
            }
            LoopExit::Disconnected(err) => {
                log::warn!("Push channel for {user_id} failed ({err}), stopping detection");
                self.session.finish(stop_timeout, false).await;
            }
        }
    }

    async fn sample(&mut self) -> LoopExit {
        let mut ticker = interval(self.options.status_interval.max(MIN_STATUS_INTERVAL));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wake = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return LoopExit::Cancelled,
                _ = ticker.tick() => Wake::Status,
                frame = self.source.next_frame() => Wake::Frame(frame),
            };

            let outcome = match wake {
                Wake::Status => self.report_status().await,
                Wake::Frame(Ok(Some(frame))) => self.process(frame).await,
                Wake::Frame(Ok(None)) => Err(LoopExit::Exhausted),
                Wake::Frame(Err(err)) => Err(LoopExit::Fault(err)),
            };
            if let Err(exit) = outcome {
                return exit;
            }
        }
    }

    async fn report_status(&self) -> Result<(), LoopExit> {
        let update = StatusUpdate::now(true);
        self.deliver(PushFrame::StatusUpdate(update)).await?;
        self.session
            .snapshot
            .send_modify(|snapshot| snapshot.last_status_at = Some(update.timestamp));
        Ok(())
    }

    async fn process(&self, frame: SourceFrame) -> Result<(), LoopExit> {
        let settings = self.session.settings.borrow().clone();
        let signal = frame.into_signal(&settings.classifier());

        self.session.snapshot.send_modify(|snapshot| {
            snapshot.last_signal = Some(signal.clone());
            snapshot.frames_processed += 1;
        });

        if signal.is_peeking && signal.confidence > settings.alert_floor {
            let admitted = self.dispatch(&settings, &signal).await;
            if admitted > 0 {
                self.session
                    .snapshot
                    .send_modify(|snapshot| snapshot.alerts_dispatched += admitted);
            }
        }

        self.deliver(PushFrame::DetectionUpdate(DetectionUpdate {
            detection_id: Uuid::new_v4().to_string(),
            is_peeking: signal.is_peeking,
            confidence: signal.confidence,
            timestamp: signal.timestamp,
        }))
        .await
    }

    /// Fan a peeking signal out to the configured channels; returns the number admitted
    async fn dispatch(&self, settings: &DetectionSettings, signal: &DetectionSignal) -> u64 {
        let mut request =
            AlertRequest::new(&self.session.user_id, settings.alert_level, signal.confidence)
                .with_metadata("face_count", json!(signal.face_count))
                .with_metadata("source", json!(self.source.name()));
        request.message.clone_from(&settings.message);

        match self.engine.dispatch_all(&settings.channels, &request).await {
            Ok(results) => results.values().filter(|admitted| **admitted).count() as u64,
            Err(err) => {
                log::error!("Dispatch for {} failed: {err}", self.session.user_id);
                0
            }
        }
    }

    /// Push a frame unless the session is cancelled first
    async fn deliver(&self, frame: PushFrame) -> Result<(), LoopExit> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(LoopExit::Cancelled),
            result = self.session.push(frame) => result.map_err(LoopExit::Disconnected),
        }
    }
}

/// Owns every user's session and its sampling loop
pub struct DetectionSessionManager {
    engine: Arc<AlertDispatchEngine>,
    sources: Arc<dyn SignalSourceFactory>,
    options: SessionOptions,
    default_settings: DetectionSettings,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    next_connection: AtomicU64,
}

impl DetectionSessionManager {
    #[must_use]
    pub fn new(
        engine: Arc<AlertDispatchEngine>,
        sources: Arc<dyn SignalSourceFactory>,
        options: SessionOptions,
    ) -> Self {
        Self {
            engine,
            sources,
            options,
            default_settings: DetectionSettings::default(),
            sessions: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    /// Settings given to sessions created from now on
    #[must_use]
    pub fn with_default_settings(mut self, settings: DetectionSettings) -> Self {
        self.default_settings = settings;
        self
    }

    #[must_use]
    pub const fn engine(&self) -> &Arc<AlertDispatchEngine> {
        &self.engine
    }

    /// Start the sampling loop for `user_id`
    ///
    /// Returns `false` if a loop is already running.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty user id or if no signal source can be opened
    pub async fn start_detection(&self, user_id: &str) -> Result<bool, SessionError> {
        validate_user_id(user_id)?;
        loop {
            let session = self.session(user_id).await;
            let mut lifecycle = session.lifecycle.lock().await;
            if lifecycle.released {
                continue;
            }
            return self.start_locked(&session, &mut lifecycle).await;
        }
    }

    async fn start_locked(
        &self,
        session: &Arc<Session>,
        lifecycle: &mut Lifecycle,
    ) -> Result<bool, SessionError> {
        let user_id = session.user_id.as_str();
        if session.state() == SessionState::Running {
            log::debug!("Detection already running for {user_id}");
            return Ok(false);
        }

        // A loop that stopped on its own still has a handle to collect
        if let Some(previous) = lifecycle.running.take() {
            previous.cancel.cancel();
            self.join(previous, user_id).await;
        }

        let source = self
            .sources
            .open(user_id)
            .await
            .map_err(|err| SessionError::Source {
                user_id: user_id.to_string(),
                reason: format!("{err:#}"),
            })?;
        let source_name = source.name();

        session.snapshot.send_modify(|snapshot| {
            snapshot.state = SessionState::Running;
            snapshot.started_at = Some(Utc::now());
        });

        let cancel = CancellationToken::new();
        let sampling = SamplingLoop {
            session: Arc::clone(session),
            engine: Arc::clone(&self.engine),
            source,
            cancel: cancel.clone(),
            options: self.options,
        };
        let handle = tokio::spawn(sampling.supervise());
        lifecycle.running = Some(RunningLoop { cancel, handle });

        log::info!("Started detection for {user_id} (source: {source_name})");
        Ok(true)
    }

    /// Stop the sampling loop for `user_id`
    ///
    /// Returns `false` if nothing was running.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty user id
    pub async fn stop_detection(&self, user_id: &str) -> Result<bool, SessionError> {
        validate_user_id(user_id)?;
        match self.existing(user_id).await {
            Some(session) => Ok(self.stop_session(&session).await),
            None => Ok(false),
        }
    }

    /// Apply a partial configuration change without interrupting a running loop
    ///
    /// Updates for one user are applied one at a time.
    ///
    /// # Errors
    ///
    /// Returns an error if the user id is empty or any part of the update is invalid;
    /// nothing is applied in that case
    pub async fn update_config(
        &self,
        user_id: &str,
        update: &ConfigUpdate,
    ) -> Result<ConfigAck, SessionError> {
        validate_user_id(user_id)?;
        loop {
            let session = self.session(user_id).await;
            let lifecycle = session.lifecycle.lock().await;
            if lifecycle.released {
                continue;
            }

            let current = session.settings.borrow().clone();
            let merged = update.apply(&current)?;
            for (channel, change) in &update.channel_configs {
                let base = self
                    .engine
                    .channel_config(*channel)
                    .await
                    .unwrap_or_else(|| ChannelConfig::new(*channel));
                change.apply(&base).validate()?;
            }

            for (channel, change) in &update.channel_configs {
                self.engine.update_channel(*channel, change).await?;
            }
            session.settings.send_replace(merged.clone());
            drop(lifecycle);

            log::info!("Updated detection settings for {user_id}");
            return Ok(ConfigAck {
                settings: merged,
                channels: self.engine.configuration().await,
            });
        }
    }

    /// Snapshot of a user's session; unknown users report an idle session
    ///
    /// # Errors
    ///
    /// Returns an error for an empty user id
    pub async fn get_status(&self, user_id: &str) -> Result<DetectionStatus, SessionError> {
        validate_user_id(user_id)?;
        let alert_stats = self.engine.stats(Some(user_id)).await;

        let (snapshot, settings) = match self.existing(user_id).await {
            Some(session) => {
                let snapshot = session.snapshot.borrow().clone();
                let settings = session.settings.borrow().clone();
                (snapshot, settings)
            }
            None => (SessionSnapshot::default(), self.default_settings.clone()),
        };

        Ok(DetectionStatus {
            user_id: user_id.to_string(),
            is_active: snapshot.state == SessionState::Running,
            state: snapshot.state,
            last_signal: snapshot.last_signal,
            last_status_at: snapshot.last_status_at,
            started_at: snapshot.started_at,
            frames_processed: snapshot.frames_processed,
            alerts_dispatched: snapshot.alerts_dispatched,
            settings,
            alert_stats,
        })
    }

    /// Add `sink` to the channels receiving the user's frames
    ///
    /// The returned id is handed back to `disconnect` when this channel goes away.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty user id
    pub async fn attach_push(
        &self,
        user_id: &str,
        sink: Arc<dyn PushSink>,
    ) -> Result<ConnectionId, SessionError> {
        validate_user_id(user_id)?;
        let connection = self.next_connection.fetch_add(1, Ordering::Relaxed);
        loop {
            let session = self.session(user_id).await;
            let lifecycle = session.lifecycle.lock().await;
            if lifecycle.released {
                continue;
            }
            session.sinks.send_modify(|sinks| {
                sinks.insert(connection, Arc::clone(&sink));
            });
            drop(lifecycle);

            log::debug!("Attached push channel {connection} for {user_id}");
            return Ok(connection);
        }
    }

    /// A push channel went away
    ///
    /// Once the user's last channel is gone, detection stops and the session
    /// record is released.
    pub async fn disconnect(&self, user_id: &str, connection: ConnectionId) {
        let Some(session) = self.existing(user_id).await else {
            return;
        };
        let mut lifecycle = session.lifecycle.lock().await;
        if lifecycle.released {
            return;
        }

        let mut remaining = 0;
        session.sinks.send_modify(|sinks| {
            sinks.remove(&connection);
            remaining = sinks.len();
        });
        if remaining > 0 {
            log::debug!("Push channel {connection} for {user_id} closed, {remaining} still attached");
            return;
        }

        self.stop_locked(&session, &mut lifecycle).await;
        lifecycle.released = true;
        let mut sessions = self.sessions.lock().await;
        if sessions
            .get(user_id)
            .is_some_and(|current| Arc::ptr_eq(current, &session))
        {
            sessions.remove(user_id);
        }
        drop(sessions);
        drop(lifecycle);
        log::info!("Released session for {user_id}");
    }

    /// Stop every running session
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.lock().await.values().cloned().collect();
        for session in sessions {
            self.stop_session(&session).await;
        }
        log::info!("All detection sessions stopped");
    }

    /// Users whose loop is currently running
    pub async fn active_users(&self) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        let mut users: Vec<String> = sessions
            .values()
            .filter(|session| session.state() == SessionState::Running)
            .map(|session| session.user_id.clone())
            .collect();
        users.sort();
        users
    }

    async fn session(&self, user_id: &str) -> Arc<Session> {
        let mut sessions = self.sessions.lock().await;
        Arc::clone(
            sessions
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(Session::new(user_id, self.default_settings.clone()))),
        )
    }

    async fn existing(&self, user_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(user_id).cloned()
    }

    async fn stop_session(&self, session: &Session) -> bool {
        let mut lifecycle = session.lifecycle.lock().await;
        self.stop_locked(session, &mut lifecycle).await
    }

    async fn stop_locked(&self, session: &Session, lifecycle: &mut Lifecycle) -> bool {
        let Some(running) = lifecycle.running.take() else {
            return false;
        };

        session.set_state(SessionState::Stopping);
        running.cancel.cancel();
        self.join(running, &session.user_id).await;
        session.set_state(SessionState::Stopped);

        log::info!("Stopped detection for {}", session.user_id);
        true
    }

    /// Wait for a cancelled loop to exit, aborting it after the stop timeout
    async fn join(&self, running: RunningLoop, user_id: &str) {
        let RunningLoop { mut handle, .. } = running;
        match tokio::time::timeout(self.options.stop_timeout, &mut handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => log::error!("Detection loop for {user_id} ended abnormally: {err}"),
            Err(_) => {
                handle.abort();
                log::warn!(
                    "Detection loop for {user_id} did not stop within {:?}; aborted (leak candidate)",
                    self.options.stop_timeout
                );
            }
        }
    }
}
