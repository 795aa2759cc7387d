//! Alert admission and fan-out
//!
//! Admission for a `(user, channel)` pair runs under a single lock so that the
//! threshold, cooldown, and rate checks plus the state update are atomic with
//! respect to each other. Handlers are invoked after the lock is released.

use chrono::{DateTime, Utc};
use std::{
    collections::{BTreeMap, BTreeSet, HashMap, VecDeque},
    fmt,
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{Mutex, RwLock},
    task::JoinSet,
    time::Instant,
};

use crate::{
    error::{validate_user_id, AlertError},
    handler::AlertHandler,
    stats::AlertStats,
    types::{AlertEvent, AlertRequest, Channel, ChannelConfig, ChannelConfigUpdate, DEFAULT_PEEK_MESSAGE},
};


/// Runtime knobs for the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Upper bound on a single handler invocation
    pub handler_timeout: Duration,
    /// Maximum retained history entries; oldest are evicted first. Zero keeps everything.
    pub history_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(10),
            history_capacity: 10_000,
        }
    }
}

/// Why an alert was not admitted
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
    Unconfigured,
    Disabled,
    BelowThreshold { confidence: f64, threshold: f64 },
    Cooldown { remaining_ms: i64 },
    RateLimited { sent: usize, max: u32 },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => f.write_str("channel not configured"),
            Self::Disabled => f.write_str("channel disabled"),
            Self::BelowThreshold {
                confidence,
                threshold,
            } => write!(f, "confidence {confidence:.2} below threshold {threshold:.2}"),
            Self::Cooldown { remaining_ms } => write!(f, "cooling down for {remaining_ms}ms"),
            Self::RateLimited { sent, max } => write!(f, "rate limited ({sent}/{max} in window)"),
        }
    }
}

#[derive(Debug, Default)]
struct RateState {
    last_sent_at: Option<DateTime<Utc>>,
    recent: VecDeque<DateTime<Utc>>,
}

#[derive(Default)]
struct EngineState {
    configs: HashMap<Channel, ChannelConfig>,
    rates: HashMap<(String, Channel), RateState>,
    history: VecDeque<Arc<AlertEvent>>,
}

impl EngineState {
    /// Run the admission pipeline and, on success, record the alert
    fn admit(
        &mut self,
        channel: Channel,
        request: &AlertRequest,
        now: DateTime<Utc>,
        history_capacity: usize,
    ) -> Result<Arc<AlertEvent>, Rejection> {
        let config = self.configs.get(&channel).ok_or(Rejection::Unconfigured)?;
        if !config.enabled {
            return Err(Rejection::Disabled);
        }
        if request.confidence.is_nan() || request.confidence < config.threshold {
            return Err(Rejection::BelowThreshold {
                confidence: request.confidence,
                threshold: config.threshold,
            });
        }

        let rate = self
            .rates
            .entry((request.user_id.clone(), channel))
            .or_default();

        let cooldown_ms = millis(config.cooldown_seconds);
        if let Some(last) = rate.last_sent_at {
            let elapsed_ms = (now - last).num_milliseconds();
            if cooldown_ms > 0 && elapsed_ms < cooldown_ms {
                return Err(Rejection::Cooldown {
                    remaining_ms: cooldown_ms - elapsed_ms,
                });
            }
        }

        let window_ms = millis(config.window_seconds);
        while let Some(oldest) = rate.recent.front() {
            if (now - *oldest).num_milliseconds() >= window_ms {
                rate.recent.pop_front();
            } else {
                break;
            }
        }
        if rate.recent.len() >= config.max_per_minute as usize {
            return Err(Rejection::RateLimited {
                sent: rate.recent.len(),
                max: config.max_per_minute,
            });
        }

        let message = request
            .message
            .as_ref()
            .filter(|message| !message.is_empty())
            .or(config.custom_message.as_ref())
            .map_or_else(|| DEFAULT_PEEK_MESSAGE.to_string(), Clone::clone);

        let event = Arc::new(AlertEvent {
            alert_id: uuid::Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            channel,
            level: request.level,
            message,
            confidence: request.confidence,
            timestamp: now,
            metadata: request.metadata.clone(),
        });

        rate.last_sent_at = Some(now);
        rate.recent.push_back(now);

        self.history.push_back(Arc::clone(&event));
        if history_capacity > 0 {
            while self.history.len() > history_capacity {
                self.history.pop_front();
            }
        }

        Ok(event)
    }
}

fn belongs_to(event: &AlertEvent, user_id: Option<&str>) -> bool {
    match user_id {
        Some(user) => event.user_id == user,
        None => true,
    }
}

fn millis(seconds: u64) -> i64 {
    i64::try_from(seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
}

/// Wall-clock readings derived from a monotonic timer, so they never step backwards
#[derive(Debug, Clone, Copy)]
struct MonotonicClock {
    anchor: DateTime<Utc>,
    started: Instant,
}

impl MonotonicClock {
    fn new() -> Self {
        Self::anchored(Utc::now())
    }

    fn anchored(anchor: DateTime<Utc>) -> Self {
        Self {
            anchor,
            started: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.started.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor + elapsed
    }
}

/// Admits alerts per channel and fans them out to registered handlers
pub struct AlertDispatchEngine {
    options: EngineOptions,
    clock: MonotonicClock,
    state: Mutex<EngineState>,
    handlers: RwLock<HashMap<Channel, Vec<Arc<dyn AlertHandler>>>>,
}

impl AlertDispatchEngine {
    /// Engine preloaded with the built-in channel configurations
    #[must_use]
    pub fn new(options: EngineOptions) -> Self {
        let configs = ChannelConfig::builtin_defaults()
            .into_iter()
            .map(|config| (config.channel, config))
            .collect();
        Self {
            options,
            clock: MonotonicClock::new(),
            state: Mutex::new(EngineState {
                configs,
                ..EngineState::default()
            }),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Engine with no configured channels
    #[must_use]
    pub fn unconfigured(options: EngineOptions) -> Self {
        Self {
            options,
            clock: MonotonicClock::new(),
            state: Mutex::new(EngineState::default()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(EngineOptions::default())
    }

    #[must_use]
    pub const fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Install or replace the configuration for `channel`
    ///
    /// Rate state and history are kept.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the config is invalid or names another channel
    pub async fn configure(&self, channel: Channel, config: ChannelConfig) -> Result<(), AlertError> {
        if config.channel != channel {
            return Err(AlertError::ChannelMismatch {
                channel,
                configured: config.channel,
            });
        }
        config.validate()?;

        log::info!(
            "Configured {channel}: enabled={}, threshold={:.2}, cooldown={}s, max={}/{}s",
            config.enabled,
            config.threshold,
            config.cooldown_seconds,
            config.max_per_minute,
            config.window_seconds
        );
        self.state.lock().await.configs.insert(channel, config);
        Ok(())
    }

    /// Merge a partial update onto the channel's configuration
    ///
    /// An unconfigured channel starts from `ChannelConfig::new`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the merged config is invalid
    pub async fn update_channel(
        &self,
        channel: Channel,
        update: &ChannelConfigUpdate,
    ) -> Result<ChannelConfig, AlertError> {
        let mut state = self.state.lock().await;
        let base = state
            .configs
            .get(&channel)
            .cloned()
            .unwrap_or_else(|| ChannelConfig::new(channel));
        let next = update.apply(&base);
        next.validate()?;
        state.configs.insert(channel, next.clone());
        drop(state);

        log::debug!("Updated {channel} configuration");
        Ok(next)
    }

    pub async fn channel_config(&self, channel: Channel) -> Option<ChannelConfig> {
        self.state.lock().await.configs.get(&channel).cloned()
    }

    /// Current configurations, ordered by channel
    pub async fn configuration(&self) -> Vec<ChannelConfig> {
        let state = self.state.lock().await;
        let mut configs: Vec<ChannelConfig> = state.configs.values().cloned().collect();
        configs.sort_by_key(|config| config.channel);
        configs
    }

    /// Append a handler; handlers run in registration order
    pub async fn register_handler(&self, channel: Channel, handler: Arc<dyn AlertHandler>) {
        log::debug!("Registered {} handler on {channel}", handler.name());
        self.handlers
            .write()
            .await
            .entry(channel)
            .or_default()
            .push(handler);
    }

    pub async fn handler_count(&self, channel: Channel) -> usize {
        self.handlers.read().await.get(&channel).map_or(0, Vec::len)
    }

    /// Attempt to send one alert on one channel
    ///
    /// Returns whether the alert was admitted. Handler failures do not affect the result.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::EmptyUserId` for an empty user id
    pub async fn try_dispatch(&self, channel: Channel, request: &AlertRequest) -> Result<bool, AlertError> {
        self.try_dispatch_at(channel, request, self.clock.now()).await
    }

    /// Same as `try_dispatch` with an explicit clock reading
    ///
    /// # Errors
    ///
    /// Returns `AlertError::EmptyUserId` for an empty user id
    pub async fn try_dispatch_at(
        &self,
        channel: Channel,
        request: &AlertRequest,
        now: DateTime<Utc>,
    ) -> Result<bool, AlertError> {
        validate_user_id(&request.user_id)?;
        match self.admit(channel, request, now).await {
            Some(event) => {
                self.notify(vec![event]).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Attempt every channel in `channels` and report the per-channel outcome
    ///
    /// Each channel is admitted independently. All admitted alerts are
    /// delivered concurrently and the call returns once every handler settled.
    ///
    /// # Errors
    ///
    /// Returns `AlertError::EmptyUserId` for an empty user id
    pub async fn dispatch_all(
        &self,
        channels: &[Channel],
        request: &AlertRequest,
    ) -> Result<BTreeMap<Channel, bool>, AlertError> {
        self.dispatch_all_at(channels, request, self.clock.now()).await
    }

    /// Same as `dispatch_all` with an explicit clock reading
    ///
    /// # Errors
    ///
    /// Returns `AlertError::EmptyUserId` for an empty user id
    pub async fn dispatch_all_at(
        &self,
        channels: &[Channel],
        request: &AlertRequest,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<Channel, bool>, AlertError> {
        validate_user_id(&request.user_id)?;

        let unique: BTreeSet<Channel> = channels.iter().copied().collect();
        let mut results = BTreeMap::new();
        let mut admitted = Vec::new();
        for channel in unique {
            let event = self.admit(channel, request, now).await;
            results.insert(channel, event.is_some());
            admitted.extend(event);
        }

        self.notify(admitted).await;
        Ok(results)
    }

    /// Statistics over the history, optionally for a single user
    pub async fn stats(&self, user_id: Option<&str>) -> AlertStats {
        self.stats_at(user_id, Utc::now()).await
    }

    pub async fn stats_at(&self, user_id: Option<&str>, now: DateTime<Utc>) -> AlertStats {
        let state = self.state.lock().await;
        AlertStats::from_events(
            state
                .history
                .iter()
                .map(Arc::as_ref)
                .filter(|event| belongs_to(event, user_id)),
            now,
        )
    }

    /// The most recent `limit` alerts, oldest first
    pub async fn history(&self, user_id: Option<&str>, limit: usize) -> Vec<AlertEvent> {
        let state = self.state.lock().await;
        let mut events: Vec<AlertEvent> = state
            .history
            .iter()
            .rev()
            .filter(|event| belongs_to(event, user_id))
            .take(limit)
            .map(|event| event.as_ref().clone())
            .collect();
        events.reverse();
        events
    }

    /// Drop history for one user, or for everyone; rate state is untouched
    ///
    /// Returns the number of removed entries.
    pub async fn clear_history(&self, user_id: Option<&str>) -> usize {
        let mut state = self.state.lock().await;
        let before = state.history.len();
        match user_id {
            Some(user) => state.history.retain(|event| event.user_id != user),
            None => state.history.clear(),
        }
        let removed = before - state.history.len();
        drop(state);

        log::info!(
            "Cleared {removed} alert(s) for {}",
            user_id.unwrap_or("all users")
        );
        removed
    }

    async fn admit(
        &self,
        channel: Channel,
        request: &AlertRequest,
        now: DateTime<Utc>,
    ) -> Option<Arc<AlertEvent>> {
        let outcome = self
            .state
            .lock()
            .await
            .admit(channel, request, now, self.options.history_capacity);

        match outcome {
            Ok(event) => {
                log::info!(
                    "Alert {} sent on {channel} to {} (confidence: {:.2})",
                    event.alert_id,
                    event.user_id,
                    event.confidence
                );
                Some(event)
            }
            Err(rejection) => {
                log::debug!("Alert on {channel} for {} suppressed: {rejection}", request.user_id);
                None
            }
        }
    }

    /// Invoke every handler of every admitted event concurrently
    async fn notify(&self, events: Vec<Arc<AlertEvent>>) {
        if events.is_empty() {
            return;
        }

        let mut tasks = JoinSet::new();
        {
            let handlers = self.handlers.read().await;
            for event in &events {
                for handler in handlers.get(&event.channel).into_iter().flatten() {
                    let handler = Arc::clone(handler);
                    let event = Arc::clone(event);
                    let timeout = self.options.handler_timeout;
                    tasks.spawn(async move {
                        let outcome = tokio::time::timeout(timeout, handler.handle(&event)).await;
                        (handler, event, outcome)
                    });
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            let (handler, event, outcome) = match joined {
                Ok(settled) => settled,
                Err(err) => {
                    log::error!("Alert handler task aborted: {err}");
                    continue;
                }
            };
            let reason = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(_) => format!("timed out after {:?}", self.options.handler_timeout),
            };
            let failure = AlertError::Handler {
                handler: handler.name().to_string(),
                channel: event.channel,
                alert_id: event.alert_id.clone(),
                reason,
            };
            log::error!("{failure}");
        }
    }
}

impl Default for AlertDispatchEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}
