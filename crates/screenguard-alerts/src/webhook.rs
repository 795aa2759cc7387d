//! Webhook delivery
//!
//! Posts each admitted `AlertEvent` as JSON. Rate limiting (429), server errors
//! and connection failures are retried with exponential backoff; other client
//! errors fail immediately.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;

use crate::{handler::AlertHandler, types::AlertEvent};

/// What a single delivery attempt produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Delivered,
    RateLimited,
    ServerError,
    NetworkError,
    Rejected,
}

impl AttemptOutcome {
    #[must_use]
    pub fn from_status(status: StatusCode) -> Self {
        if status.is_success() {
            Self::Delivered
        } else if status == StatusCode::TOO_MANY_REQUESTS {
            Self::RateLimited
        } else if status.is_server_error() {
            Self::ServerError
        } else {
            Self::Rejected
        }
    }
}

/// Delay before the next attempt, or `None` if the outcome is final
///
/// Rate limiting backs off one step further than transient failures.
#[must_use]
pub fn retry_delay(outcome: AttemptOutcome, attempt: u32, base: Duration) -> Option<Duration> {
    let exponent = match outcome {
        AttemptOutcome::Delivered | AttemptOutcome::Rejected => return None,
        AttemptOutcome::RateLimited => attempt.saturating_add(1),
        AttemptOutcome::ServerError | AttemptOutcome::NetworkError => attempt,
    };
    Some(base.saturating_mul(2u32.saturating_pow(exponent)))
}

pub struct WebhookHandler {
    url: String,
    max_attempts: u32,
    base_delay: Duration,
    client: reqwest::Client,
}

impl WebhookHandler {
    /// Create a handler posting to `url`
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created
    pub fn new(url: impl Into<String>, max_attempts: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            url: url.into(),
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_secs(1),
            client,
        })
    }

    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    async fn attempt(&self, event: &AlertEvent) -> (AttemptOutcome, String) {
        match self.client.post(&self.url).json(event).send().await {
            Ok(response) => {
                let status = response.status();
                (AttemptOutcome::from_status(status), format!("HTTP {status}"))
            }
            Err(err) if err.is_timeout() || err.is_connect() => {
                (AttemptOutcome::NetworkError, err.to_string())
            }
            Err(err) => (AttemptOutcome::Rejected, err.to_string()),
        }
    }
}

#[async_trait]
impl AlertHandler for WebhookHandler {
    async fn handle(&self, event: &AlertEvent) -> Result<()> {
        let mut last_failure = String::new();

        for attempt in 0..self.max_attempts {
            let (outcome, detail) = self.attempt(event).await;
            if outcome == AttemptOutcome::Delivered {
                log::debug!("Webhook delivered alert {} to {}", event.alert_id, self.url);
                return Ok(());
            }

            let Some(delay) = retry_delay(outcome, attempt, self.base_delay) else {
                anyhow::bail!("webhook rejected alert {}: {detail}", event.alert_id);
            };
            last_failure = detail;
            if attempt + 1 < self.max_attempts {
                log::warn!(
                    "Webhook attempt {} for alert {} failed ({last_failure}), retrying in {delay:?}",
                    attempt + 1,
                    event.alert_id
                );
                tokio::time::sleep(delay).await;
            }
        }

        anyhow::bail!(
            "webhook gave up on alert {} after {} attempt(s): {last_failure}",
            event.alert_id,
            self.max_attempts
        )
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AlertLevel, Channel, Metadata};
    use chrono::Utc;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn event() -> AlertEvent {
        AlertEvent {
            alert_id: "a1".to_string(),
            user_id: "alice".to_string(),
            channel: Channel::Notification,
            level: AlertLevel::High,
            message: "peek".to_string(),
            confidence: 0.9,
            timestamp: Utc::now(),
            metadata: Metadata::new(),
        }
    }

    /// Serve one canned status line per connection, in order
    async fn serve_statuses(statuses: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/alerts", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            for status in statuses {
                let (mut stream, _) = listener.accept().await.unwrap();
                read_request(&mut stream).await;
                counter.fetch_add(1, Ordering::SeqCst);
                let response =
                    format!("HTTP/1.1 {status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                stream.write_all(response.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });

        (url, hits)
    }

    async fn read_request(stream: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf);
            if let Some(header_end) = text.find("\r\n\r\n") {
                let body_len = text[..header_end]
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + body_len {
                    return;
                }
            }
        }
    }

    #[test]
    fn test_retry_delay_policy() {
        let base = Duration::from_secs(1);
        assert_eq!(retry_delay(AttemptOutcome::Delivered, 0, base), None);
        assert_eq!(retry_delay(AttemptOutcome::Rejected, 2, base), None);
        assert_eq!(
            retry_delay(AttemptOutcome::ServerError, 0, base),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            retry_delay(AttemptOutcome::NetworkError, 2, base),
            Some(Duration::from_secs(4))
        );
        assert_eq!(
            retry_delay(AttemptOutcome::RateLimited, 0, base),
            Some(Duration::from_secs(2))
        );
    }

    #[test]
    fn test_outcome_from_status() {
        assert_eq!(AttemptOutcome::from_status(StatusCode::NO_CONTENT), AttemptOutcome::Delivered);
        assert_eq!(
            AttemptOutcome::from_status(StatusCode::TOO_MANY_REQUESTS),
            AttemptOutcome::RateLimited
        );
        assert_eq!(
            AttemptOutcome::from_status(StatusCode::BAD_GATEWAY),
            AttemptOutcome::ServerError
        );
        assert_eq!(AttemptOutcome::from_status(StatusCode::NOT_FOUND), AttemptOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_webhook_retries_server_errors() {
        let (url, hits) = serve_statuses(vec!["503 Service Unavailable", "200 OK"]).await;
        let handler = WebhookHandler::new(url, 3)
            .unwrap()
            .with_base_delay(Duration::from_millis(1));

        handler.handle(&event()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_webhook_does_not_retry_client_errors() {
        let (url, hits) = serve_statuses(vec!["400 Bad Request"]).await;
        let handler = WebhookHandler::new(url, 3)
            .unwrap()
            .with_base_delay(Duration::from_millis(1));

        let err = handler.handle(&event()).await.unwrap_err();
        assert!(err.to_string().contains("rejected"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_webhook_gives_up_when_unreachable() {
        let handler = WebhookHandler::new("http://127.0.0.1:1/alerts", 2)
            .unwrap()
            .with_base_delay(Duration::from_millis(1));

        let err = handler.handle(&event()).await.unwrap_err();
        assert!(err.to_string().contains("after 2 attempt(s)"));
        assert_eq!(handler.name(), "webhook");
    }
}
