//! Outbound webhook dispatcher.
//!
//! Consumes the same visit events as the click recorder. Each event fans out
//! into one independent delivery task per active subscriber, so a slow
//! endpoint never delays another. A delivery is up to `max_attempts` HTTP
//! posts with attempt-indexed backoff between them; every attempt leaves an
//! immutable log row, and the subscriber's rolling counters move exactly
//! once per delivery.

use hmac::{Hmac, Mac};
use reqwest::header::CONTENT_TYPE;
use sha2::Sha256;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::WebhookConfig;
use crate::events::{VisitEvent, EVENT_LINK_CLICKED};
use crate::models::{now_ts, NewWebhookLog, Webhook};
use crate::storage::Storage;

pub const SIGNATURE_HEADER: &str = "X-Shunt-Signature";

pub struct WebhookDispatcher {
    storage: Arc<dyn Storage>,
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookDispatcher {
    pub fn new(storage: Arc<dyn Storage>, config: WebhookConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        Ok(Self {
            storage,
            config,
            client,
        })
    }

    /// Run the dispatcher until the bus closes or shutdown is signalled.
    pub fn spawn(
        self: Arc<Self>,
        mut events: broadcast::Receiver<VisitEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => self.dispatch(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "webhook dispatcher lagged, events lost");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("event bus closed, webhook dispatcher stopping");
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            info!("webhook dispatcher received shutdown signal");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Fan one event out to every subscribed endpoint. Each delivery runs in
    /// its own task.
    pub async fn dispatch(self: &Arc<Self>, event: VisitEvent) {
        let subscribers = match self
            .storage
            .active_webhooks_for_event(EVENT_LINK_CLICKED)
            .await
        {
            Ok(subscribers) => subscribers,
            Err(err) => {
                warn!(error = %err, "failed to load webhook subscribers");
                return;
            }
        };
        if subscribers.is_empty() {
            return;
        }

        let payload = serde_json::json!({
            "event": EVENT_LINK_CLICKED,
            "created_at": now_ts(),
            "data": event,
        });
        let payload = match serde_json::to_string(&payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(error = %err, "webhook payload serialization failed");
                return;
            }
        };

        for webhook in subscribers {
            let dispatcher = Arc::clone(self);
            let payload = payload.clone();
            tokio::spawn(async move {
                dispatcher.deliver(&webhook, &payload).await;
            });
        }
    }

    /// One delivery: bounded attempts against a single endpoint, a log row
    /// per attempt, counters updated once at the end.
    pub async fn deliver(&self, webhook: &Webhook, payload: &str) {
        let signature = sign(&webhook.secret, payload);
        let mut last_error: Option<String> = None;

        for attempt in 1..=self.config.max_attempts.max(1) {
            if attempt > 1 {
                tokio::time::sleep(self.config.backoff_after_attempt(attempt - 1)).await;
            }

            let outcome = self.post(webhook, payload, &signature).await;
            let success = outcome.success;
            last_error = outcome.error.clone();

            let log = NewWebhookLog {
                webhook_id: webhook.id,
                event: EVENT_LINK_CLICKED.to_string(),
                payload: payload.to_string(),
                status_code: outcome.status_code,
                response_body: outcome.snippet,
                duration_ms: outcome.duration_ms,
                attempt: attempt as i64,
                success,
            };
            if let Err(err) = self.storage.append_webhook_log(log).await {
                warn!(webhook_id = webhook.id, error = %err, "failed to append webhook log");
            }

            if success {
                debug!(webhook_id = webhook.id, attempt, "webhook delivered");
                self.finish(webhook, true, None).await;
                return;
            }
        }

        warn!(
            webhook_id = webhook.id,
            url = %webhook.url,
            "webhook delivery failed after {} attempts",
            self.config.max_attempts
        );
        self.finish(webhook, false, last_error.as_deref()).await;
    }

    async fn post(&self, webhook: &Webhook, payload: &str, signature: &str) -> AttemptOutcome {
        let started = Instant::now();
        let response = self
            .client
            .post(&webhook.url)
            .header(CONTENT_TYPE, "application/json")
            .header(SIGNATURE_HEADER, signature)
            .body(payload.to_string())
            .send()
            .await;
        let duration_ms = started.elapsed().as_millis() as i64;

        match response {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                AttemptOutcome {
                    status_code: Some(status.as_u16() as i64),
                    snippet: Some(truncate_snippet(&body, self.config.response_snippet_bytes)),
                    duration_ms,
                    success: status.is_success(),
                    error: if status.is_success() {
                        None
                    } else {
                        Some(format!("endpoint returned {status}"))
                    },
                }
            }
            Err(err) => AttemptOutcome {
                status_code: None,
                snippet: None,
                duration_ms,
                success: false,
                error: Some(truncate_snippet(
                    &err.to_string(),
                    self.config.response_snippet_bytes,
                )),
            },
        }
    }

    async fn finish(&self, webhook: &Webhook, success: bool, error: Option<&str>) {
        if let Err(err) = self
            .storage
            .record_delivery_outcome(webhook.id, success, error)
            .await
        {
            warn!(webhook_id = webhook.id, error = %err, "failed to record delivery outcome");
        }
    }
}

struct AttemptOutcome {
    status_code: Option<i64>,
    snippet: Option<String>,
    duration_ms: i64,
    success: bool,
    error: Option<String>,
}

/// HMAC-SHA256 of the exact payload bytes, hex-encoded with the scheme
/// prefix receivers verify against.
pub fn sign(secret: &str, payload: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut out = String::with_capacity(7 + digest.len() * 2);
    out.push_str("sha256=");
    for byte in digest {
        write!(out, "{byte:02x}").expect("writing to a String cannot fail");
    }
    out
}

/// Clamp a response body to `max` bytes without splitting a UTF-8 character.
pub fn truncate_snippet(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while end > 0 && !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let sig = sign("key", "The quick brown fox jumps over the lazy dog");
        assert_eq!(
            sig,
            "sha256=f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn snippet_truncation_respects_char_boundaries() {
        assert_eq!(truncate_snippet("short", 512), "short");

        let body = "héllo wörld";
        let cut = truncate_snippet(body, 2);
        assert!(cut.len() <= 2);
        assert!(body.starts_with(&cut));
    }

    #[test]
    fn snippet_truncation_exact_limit() {
        assert_eq!(truncate_snippet("abcdef", 6), "abcdef");
        assert_eq!(truncate_snippet("abcdef", 4), "abcd");
    }
}
