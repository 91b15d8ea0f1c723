//! Caption endpoint poster.
//!
//! Delivers final text to the meeting platform's closed-caption URL as
//! `POST <url>&seq=<N>` with a `text/plain` body. One worker drains the
//! queue with at most one POST in flight, a minimum interval between
//! successful posts (coalescing whatever arrives in between), and a
//! bounded retry budget per item.

use crate::config::CaptionSettings;
use crate::defaults;
use crate::logging::FailureGate;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub struct CaptionPoster {
    tx: Option<mpsc::UnboundedSender<String>>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl CaptionPoster {
    /// Spawn the poster worker. With no URL configured, `submit` is a no-op.
    pub fn spawn(settings: CaptionSettings, gate: Arc<FailureGate>) -> Self {
        if !settings.is_active() {
            return Self {
                tx: None,
                worker: std::sync::Mutex::new(None),
                shutdown: CancellationToken::new(),
            };
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let worker = tokio::spawn(worker_loop(settings, rx, shutdown.clone(), gate));
        Self {
            tx: Some(tx),
            worker: std::sync::Mutex::new(Some(worker)),
            shutdown,
        }
    }

    /// Enqueue a final for delivery. Never blocks.
    pub fn submit(&self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(text.to_string());
        }
    }

    /// Stop the worker, abandoning pending items after a short grace.
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(defaults::CAPTION_SHUTDOWN_GRACE, &mut handle)
                .await
                .is_err()
            {
                handle.abort();
                debug!("Caption worker abandoned after shutdown grace");
            }
        }
    }
}

async fn worker_loop(
    settings: CaptionSettings,
    mut rx: mpsc::UnboundedReceiver<String>,
    shutdown: CancellationToken,
    gate: Arc<FailureGate>,
) {
    let Some(base_url) = settings.post_url.clone() else {
        return;
    };
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => {
            error!("Caption poster could not build an HTTP client: {e}");
            return;
        }
    };

    let min_interval = Duration::from_secs_f64(settings.min_post_interval_seconds);
    // Starts at 1; advances only on a 2xx response.
    let mut seq: u64 = 1;
    let mut last_success: Option<Instant> = None;

    loop {
        let mut payload = tokio::select! {
            item = rx.recv() => match item {
                Some(text) => text,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        // Hold until the minimum interval since the last successful post has
        // elapsed, coalescing anything that arrives in the meantime.
        if let Some(last) = last_success {
            let deadline = last + min_interval;
            while Instant::now() < deadline {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline.into()) => break,
                    more = rx.recv() => match more {
                        Some(text) => {
                            payload.push('\n');
                            payload.push_str(&text);
                        }
                        None => break,
                    },
                    _ = shutdown.cancelled() => break,
                }
            }
        }

        // At most one in-flight POST; retry with backoff, then drop.
        let mut consecutive_failures: u32 = 0;
        let mut backoff = defaults::CAPTION_RETRY_INITIAL;
        loop {
            match post_caption(&client, &base_url, seq, &payload).await {
                Ok(()) => {
                    debug!("Caption posted (seq={seq})");
                    seq += 1;
                    last_success = Some(Instant::now());
                    gate.reset(&base_url);
                    break;
                }
                Err(message) => {
                    consecutive_failures += 1;
                    if gate.should_log(&base_url) {
                        warn!(
                            "Caption POST failed ({consecutive_failures}/{}): {message}",
                            defaults::CAPTION_MAX_FAILURES,
                        );
                    }
                    if consecutive_failures >= defaults::CAPTION_MAX_FAILURES {
                        error!(
                            "Dropping caption after {} consecutive failures",
                            defaults::CAPTION_MAX_FAILURES,
                        );
                        break;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.cancelled() => return,
                    }
                    backoff = (backoff * 2).min(defaults::CAPTION_RETRY_MAX);
                }
            }
        }
    }
}

/// One POST attempt. Any non-2xx status is an error carrying a body snippet.
async fn post_caption(
    client: &reqwest::Client,
    base_url: &str,
    seq: u64,
    payload: &str,
) -> std::result::Result<(), String> {
    let url = build_caption_url(base_url, seq)?;
    let response = client
        .post(url)
        .header(
            reqwest::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )
        .body(payload.to_string())
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(format!("status={status} body={}", snippet(&body)))
    }
}

/// Append the sequence number to the caption URL, preserving its query.
fn build_caption_url(base_url: &str, seq: u64) -> std::result::Result<String, String> {
    let mut url =
        reqwest::Url::parse(base_url).map_err(|e| format!("invalid CAPTION_POST_URL: {e}"))?;
    url.query_pairs_mut().append_pair("seq", &seq.to_string());
    Ok(url.to_string())
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= 120 {
        trimmed.to_string()
    } else {
        let cut: String = trimmed.chars().take(120).collect();
        format!("{cut}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_appends_seq_to_existing_query() {
        let url = build_caption_url("https://meet.example/closedcaption?id=42", 1).unwrap();
        assert_eq!(url, "https://meet.example/closedcaption?id=42&seq=1");
    }

    #[test]
    fn test_build_url_without_query() {
        let url = build_caption_url("https://meet.example/cc", 7).unwrap();
        assert_eq!(url, "https://meet.example/cc?seq=7");
    }

    #[test]
    fn test_build_url_rejects_garbage() {
        assert!(build_caption_url("not a url", 1).is_err());
    }

    #[test]
    fn test_snippet_truncates_long_bodies() {
        let long = "x".repeat(500);
        let cut = snippet(&long);
        assert!(cut.chars().count() <= 121);
        assert!(cut.ends_with('…'));
    }

    #[tokio::test]
    async fn test_disabled_poster_is_noop() {
        let settings = CaptionSettings {
            enabled: true,
            post_url: None,
            min_post_interval_seconds: 1.0,
        };
        let poster = CaptionPoster::spawn(
            settings,
            Arc::new(FailureGate::new(defaults::FAILURE_LOG_COOLDOWN)),
        );
        poster.submit("Bonan tagon.");
        poster.close().await;
    }

    #[tokio::test]
    async fn test_empty_submission_ignored() {
        let settings = CaptionSettings {
            enabled: false,
            post_url: Some("https://meet.example/cc".to_string()),
            min_post_interval_seconds: 1.0,
        };
        let poster = CaptionPoster::spawn(
            settings,
            Arc::new(FailureGate::new(defaults::FAILURE_LOG_COOLDOWN)),
        );
        poster.submit("   ");
        poster.close().await;
    }
}
