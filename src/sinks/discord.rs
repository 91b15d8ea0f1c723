//! Discord webhook batcher.
//!
//! Accumulates enriched finals and flushes them as one multilingual message
//! when a sentence boundary has been reached after the flush interval, when
//! the formatted size crosses the threshold, or on close. Delivery retries
//! with backoff and drops the message after the attempt budget.

use crate::config::WebhookSettings;
use crate::defaults;
use crate::logging::FailureGate;
use crate::pipeline::text::ends_sentence;
use crate::pipeline::types::EnrichedFinal;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Display labels for translated sections.
fn language_label(code: &str) -> String {
    match code {
        "ja" => "日本語".to_string(),
        "ko" => "한국어".to_string(),
        "en" => "English".to_string(),
        other => other.to_uppercase(),
    }
}

/// Delivery seam so batching can be tested without a webhook.
#[async_trait]
pub trait WebhookDelivery: Send + Sync {
    async fn deliver(&self, body: &str) -> std::result::Result<(), String>;
}

/// Real webhook delivery: `POST {content, username}` as JSON.
struct HttpDelivery {
    url: String,
    username: String,
    client: reqwest::Client,
}

#[async_trait]
impl WebhookDelivery for HttpDelivery {
    async fn deliver(&self, body: &str) -> std::result::Result<(), String> {
        let payload = json!({
            "content": body,
            "username": self.username,
        });
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("status={status} body={}", body.trim()))
        }
    }
}

pub struct DiscordBatcher {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<EnrichedFinal>>>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DiscordBatcher {
    /// Spawn the batcher worker. Disabled settings yield a no-op batcher.
    pub fn spawn(
        settings: WebhookSettings,
        targets: Vec<String>,
        gate: Arc<FailureGate>,
    ) -> Self {
        let Some(url) = settings.url.clone().filter(|_| settings.is_active()) else {
            return Self {
                tx: std::sync::Mutex::new(None),
                worker: std::sync::Mutex::new(None),
            };
        };

        let delivery: Arc<dyn WebhookDelivery> = Arc::new(HttpDelivery {
            url,
            username: settings.username.clone(),
            client: reqwest::Client::new(),
        });
        Self::spawn_with_delivery(settings, targets, gate, delivery)
    }

    /// Spawn with an explicit delivery implementation (tests).
    pub fn spawn_with_delivery(
        settings: WebhookSettings,
        targets: Vec<String>,
        gate: Arc<FailureGate>,
        delivery: Arc<dyn WebhookDelivery>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(worker_loop(settings, targets, gate, delivery, rx));
        Self {
            tx: std::sync::Mutex::new(Some(tx)),
            worker: std::sync::Mutex::new(Some(worker)),
        }
    }

    /// Append one enriched final to the pending batch. Never blocks.
    pub fn add(&self, entry: EnrichedFinal) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(entry);
        }
    }

    /// Force-flush the pending batch and stop the worker.
    pub async fn close(&self) {
        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn worker_loop(
    settings: WebhookSettings,
    targets: Vec<String>,
    gate: Arc<FailureGate>,
    delivery: Arc<dyn WebhookDelivery>,
    mut rx: mpsc::UnboundedReceiver<EnrichedFinal>,
) {
    let flush_interval = Duration::from_secs_f64(settings.flush_interval_seconds);
    let mut entries: Vec<EnrichedFinal> = Vec::new();
    let mut deadline: Option<Instant> = None;
    // Set when the interval elapsed without a sentence boundary; the next
    // deadline flushes unconditionally (idle timeout).
    let mut held_once = false;

    loop {
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            item = rx.recv() => match item {
                Some(entry) => {
                    entries.push(entry);
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + flush_interval);
                        held_once = false;
                    }
                    let formatted = format_batch(&entries, &targets);
                    if formatted.chars().count() >= settings.max_chars {
                        flush(&mut entries, &targets, &delivery, &gate).await;
                        deadline = None;
                        held_once = false;
                    }
                }
                None => {
                    // Close(): force-flush whatever is pending.
                    flush(&mut entries, &targets, &delivery, &gate).await;
                    break;
                }
            },
            _ = timer => {
                let boundary_seen = entries
                    .last()
                    .map(|e| ends_sentence(&e.transcript.text))
                    .unwrap_or(false);
                if boundary_seen || held_once {
                    flush(&mut entries, &targets, &delivery, &gate).await;
                    deadline = None;
                    held_once = false;
                } else {
                    // No sentence boundary yet: hold one more interval.
                    deadline = Some(Instant::now() + flush_interval);
                    held_once = true;
                }
            },
        }
    }
}

/// Format, split against the hard cap, and deliver sequentially in order.
async fn flush(
    entries: &mut Vec<EnrichedFinal>,
    targets: &[String],
    delivery: &Arc<dyn WebhookDelivery>,
    gate: &Arc<FailureGate>,
) {
    if entries.is_empty() {
        return;
    }
    let body = format_batch(entries, targets);
    entries.clear();

    for chunk in split_message(&body, defaults::WEBHOOK_HARD_CAP_CHARS) {
        deliver_with_retry(&chunk, delivery, gate).await;
    }
}

async fn deliver_with_retry(
    body: &str,
    delivery: &Arc<dyn WebhookDelivery>,
    gate: &Arc<FailureGate>,
) {
    let mut backoff = defaults::WEBHOOK_RETRY_INITIAL;
    for attempt in 1..=defaults::WEBHOOK_MAX_ATTEMPTS {
        match delivery.deliver(body).await {
            Ok(()) => {
                debug!("Webhook message delivered");
                gate.reset("webhook");
                return;
            }
            Err(message) => {
                if gate.should_log("webhook") {
                    warn!(
                        "Webhook delivery failed (attempt {attempt}/{}): {message}",
                        defaults::WEBHOOK_MAX_ATTEMPTS,
                    );
                }
                if attempt < defaults::WEBHOOK_MAX_ATTEMPTS {
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(defaults::WEBHOOK_RETRY_MAX);
                }
            }
        }
    }
    error!(
        "Dropping webhook message after {} attempts",
        defaults::WEBHOOK_MAX_ATTEMPTS,
    );
}

/// Grouped layout: the Esperanto block first, then one block per target
/// language that has at least one translation, in configured order.
fn format_batch(entries: &[EnrichedFinal], targets: &[String]) -> String {
    let mut sections: Vec<String> = Vec::new();

    let source_lines: Vec<&str> = entries
        .iter()
        .map(|e| e.transcript.text.as_str())
        .collect();
    sections.push(format!("Esperanto:\n{}", source_lines.join("\n")));

    for lang in targets {
        let lines: Vec<&str> = entries
            .iter()
            .filter_map(|e| e.translations.get(lang).map(String::as_str))
            .collect();
        if !lines.is_empty() {
            sections.push(format!("{}:\n{}", language_label(lang), lines.join("\n")));
        }
    }

    sections.join("\n")
}

/// Split an over-cap body into sequential posts on line boundaries,
/// hard-splitting any single line that alone exceeds the cap.
fn split_message(body: &str, cap: usize) -> Vec<String> {
    if body.chars().count() <= cap {
        return vec![body.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in body.split('\n') {
        let mut line = line.to_string();
        while line.chars().count() > cap {
            let head: String = line.chars().take(cap).collect();
            let rest: String = line.chars().skip(cap).collect();
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            chunks.push(head);
            line = rest;
        }
        let needed = line.chars().count() + if current.is_empty() { 0 } else { 1 };
        if current.chars().count() + needed > cap && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(&line);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
