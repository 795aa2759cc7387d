use anyhow::Result;
use async_trait::async_trait;

use crate::types::{AlertEvent, AlertLevel};

/// Delivery capability for one notification channel
///
/// Invoked once per admitted alert. Implementations own any retry policy; the
/// engine only isolates failures and enforces a timeout.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    /// Deliver an alert
    ///
    /// # Errors
    ///
    /// Returns an error if delivery failed; the engine logs it and moves on
    async fn handle(&self, event: &AlertEvent) -> Result<()>;

    /// Name used in logs
    fn name(&self) -> &str;
}

/// Writes alerts to the log, severity mapped from the alert level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl AlertHandler for LogHandler {
    async fn handle(&self, event: &AlertEvent) -> Result<()> {
        let level = match event.level {
            AlertLevel::Low => log::Level::Debug,
            AlertLevel::Medium => log::Level::Info,
            AlertLevel::High | AlertLevel::Critical => log::Level::Warn,
        };
        log::log!(
            level,
            "[{}] {} for {} ({:.2}): {}",
            event.channel,
            event.level,
            event.user_id,
            event.confidence,
            event.message
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Adapts a synchronous closure into a handler
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&AlertEvent) -> Result<()> + Send + Sync,
{
    #[must_use]
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
        }
    }
}

#[async_trait]
impl<F> AlertHandler for FnHandler<F>
where
    F: Fn(&AlertEvent) -> Result<()> + Send + Sync,
{
    async fn handle(&self, event: &AlertEvent) -> Result<()> {
        (self.func)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
