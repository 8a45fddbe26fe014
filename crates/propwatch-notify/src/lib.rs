//! Notification delivery: sink contract, rate limiting, retrying dispatcher,
//! and the Discord webhook sink.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use propwatch_core::{EventKind, NotifiableEvent, Priority};
use propwatch_storage::{classify_reqwest_error, BackoffPolicy, RetryDisposition};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "propwatch-notify";

#[derive(Debug, Error)]
pub enum SinkError {
    /// Worth retrying: timeouts, connection failures, 429, 5xx.
    #[error("transient sink failure: {0}")]
    Transient(String),
    /// Not worth retrying: rejected payloads, dead endpoints.
    #[error("permanent sink failure: {0}")]
    Permanent(String),
}

/// Delivery endpoint for notifiable events. At-least-once semantics; the
/// diff engine guarantees each event is only generated once.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, event: &NotifiableEvent) -> Result<(), SinkError>;
}

/// Sliding-window rate limiter: at most `limit` acquisitions in any rolling
/// window. `acquire` suspends until capacity is available; it never drops.
#[derive(Debug)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    sent: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit: limit.max(1) as usize,
            window: Duration::from_secs(60),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut sent = self.sent.lock().await;
            let now = Instant::now();
            while sent
                .front()
                .is_some_and(|t| now.duration_since(*t) >= self.window)
            {
                sent.pop_front();
            }
            if sent.len() < self.limit {
                sent.push_back(now);
                return;
            }
            let oldest = *sent.front().expect("non-empty at limit");
            let wait = self.window - now.duration_since(oldest);
            drop(sent);
            warn!(wait_ms = wait.as_millis() as u64, "rate limit reached, pacing");
            tokio::time::sleep(wait).await;
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("permanent failure, not retried: {0}")]
    Permanent(String),
    #[error("retries exhausted: {0}")]
    RetriesExhausted(String),
}

/// Delivers events through a shared rate limiter, retrying transient
/// failures with exponential backoff. A failed event is reported back to
/// the caller and never aborts anything beyond itself.
pub struct Dispatcher {
    sink: Arc<dyn NotificationSink>,
    limiter: RateLimiter,
    backoff: BackoffPolicy,
}

impl Dispatcher {
    pub fn new(sink: Arc<dyn NotificationSink>, rate_limit_per_minute: u32, backoff: BackoffPolicy) -> Self {
        Self {
            sink,
            limiter: RateLimiter::per_minute(rate_limit_per_minute),
            backoff,
        }
    }

    pub async fn dispatch(&self, event: &NotifiableEvent) -> Result<(), DispatchError> {
        self.limiter.acquire().await;

        let mut last_reason = String::new();
        for attempt in 0..=self.backoff.max_retries {
            match self.sink.send(event).await {
                Ok(()) => {
                    info!(
                        id = %event.listing.id,
                        kind = ?event.kind,
                        price = event.listing.price,
                        "notification delivered"
                    );
                    return Ok(());
                }
                Err(SinkError::Permanent(reason)) => {
                    return Err(DispatchError::Permanent(reason));
                }
                Err(SinkError::Transient(reason)) => {
                    last_reason = reason;
                    if attempt < self.backoff.max_retries {
                        let delay = self.backoff.delay_for_attempt(attempt);
                        warn!(
                            id = %event.listing.id,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            reason = %last_reason,
                            "transient delivery failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(DispatchError::RetriesExhausted(last_reason))
    }
}

/// Discord webhook sink rendering events as rich embeds.
pub struct DiscordSink {
    webhook_url: String,
    max_price: u64,
    client: reqwest::Client,
}

impl DiscordSink {
    pub fn new(webhook_url: impl Into<String>, max_price: u64) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("building webhook client")?;
        Ok(Self {
            webhook_url: webhook_url.into(),
            max_price,
            client,
        })
    }

    /// Post a configuration smoke-test embed to the webhook.
    pub async fn send_test(&self) -> Result<(), SinkError> {
        let embed = serde_json::json!({
            "title": "Property monitor test notification",
            "description": "The webhook is configured correctly. \
                Notifications will arrive here when matching listings appear.",
            "color": 0x00FF00,
            "fields": [
                { "name": "Status", "value": "operational", "inline": true },
                { "name": "Budget filter", "value": format!("<= {}", self.max_price), "inline": true },
            ],
            "timestamp": Utc::now().to_rfc3339(),
        });
        self.post_embed(embed).await
    }

    fn build_embed(&self, event: &NotifiableEvent) -> serde_json::Value {
        let listing = &event.listing;
        let color = match listing.priority(self.max_price) {
            Priority::Urgent => 0xFF0000,
            Priority::High => 0xFFA500,
            Priority::Normal => 0x00FF00,
        };

        let title = match (event.kind, event.previous_price) {
            (EventKind::New, _) => "New listing found".to_string(),
            (EventKind::PriceChanged, Some(prev)) if listing.price < prev => {
                format!("Price drop: {} -> {}", prev, listing.price)
            }
            (EventKind::PriceChanged, Some(prev)) => {
                format!("Price increase: {} -> {}", prev, listing.price)
            }
            (EventKind::PriceChanged, None) => "Price changed".to_string(),
        };

        let mut fields = vec![
            serde_json::json!({ "name": "Price", "value": format!("Rs {}/month", listing.price), "inline": true }),
            serde_json::json!({ "name": "Location", "value": listing.location, "inline": false }),
        ];
        if let Some(bedrooms) = listing.bedrooms {
            fields.push(serde_json::json!({ "name": "Bedrooms", "value": bedrooms.to_string(), "inline": true }));
        }
        if let Some(bathrooms) = listing.bathrooms {
            fields.push(serde_json::json!({ "name": "Bathrooms", "value": bathrooms.to_string(), "inline": true }));
        }
        if let Some(property_type) = &listing.property_type {
            fields.push(serde_json::json!({ "name": "Type", "value": property_type, "inline": true }));
        }
        if let Some(minutes) = listing.posted_minutes_ago {
            fields.push(serde_json::json!({ "name": "Posted", "value": humanize_minutes(minutes), "inline": true }));
        }

        serde_json::json!({
            "title": title,
            "description": format!("**{}**\n\n{}", listing.title, listing.priority(self.max_price).label()),
            "url": listing.url,
            "color": color,
            "fields": fields,
            "timestamp": Utc::now().to_rfc3339(),
        })
    }

    async fn post_embed(&self, embed: serde_json::Value) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.webhook_url)
            .json(&serde_json::json!({ "embeds": [embed] }))
            .send()
            .await
            .map_err(|err| match classify_reqwest_error(&err) {
                RetryDisposition::Retryable => SinkError::Transient(err.to_string()),
                RetryDisposition::NonRetryable => SinkError::Permanent(err.to_string()),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            return Err(SinkError::Transient(format!(
                "webhook rate limited, retry after {retry_after}s"
            )));
        }
        if status.is_server_error() {
            return Err(SinkError::Transient(format!("webhook returned {status}")));
        }
        Err(SinkError::Permanent(format!("webhook rejected request: {status}")))
    }
}

#[async_trait]
impl NotificationSink for DiscordSink {
    async fn send(&self, event: &NotifiableEvent) -> Result<(), SinkError> {
        self.post_embed(self.build_embed(event)).await
    }
}

fn humanize_minutes(minutes: u32) -> String {
    if minutes < 60 {
        format!("{minutes} minutes ago")
    } else if minutes < 1_440 {
        let hours = minutes / 60;
        format!("{hours} hour{} ago", if hours > 1 { "s" } else { "" })
    } else {
        let days = minutes / 1_440;
        format!("{days} day{} ago", if days > 1 { "s" } else { "" })
    }
}
