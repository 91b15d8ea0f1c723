//! Default configuration constants for transkribo.
//!
//! This module provides shared constants used across different configuration types
//! to ensure consistency and eliminate duplication.

use std::time::Duration;

/// Default pipeline sample rate in Hz.
///
/// 16kHz is the standard for speech recognition and provides a good balance
/// between quality and computational efficiency for meeting audio.
pub const SAMPLE_RATE: u32 = 16_000;

/// Default frame duration in seconds.
///
/// Half-second frames keep partial latency low while staying well above the
/// per-message overhead of the streaming recognizer protocols.
pub const CHUNK_DURATION_SECONDS: f64 = 0.5;

/// Capacity of the capture frame queue. On overflow the oldest frame is
/// dropped so the recognizer always sees the freshest audio.
pub const FRAME_QUEUE_CAPACITY: usize = 32;

/// Capacity of the transcript event channel between the recognizer and the
/// pipeline. The recognizer blocks when it fills; it must never be lossy.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long the event channel may stay full before the pipeline records a
/// stall.
pub const EVENT_STALL_WARNING: Duration = Duration::from_secs(2);

/// Interval between device supervisor checks.
pub const DEVICE_CHECK_INTERVAL_SECONDS: f64 = 2.0;

/// No frames for this long marks the capture stream dead.
pub const DEAD_STREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Freshly bound streams get this long before silence counts against them.
pub const BIND_GRACE_PERIOD: Duration = Duration::from_millis(1500);

/// Device open retry backoff bounds.
pub const BIND_RETRY_INITIAL: Duration = Duration::from_millis(500);
pub const BIND_RETRY_MAX: Duration = Duration::from_secs(5);

/// Default source language. The recognizer, translation source, and caption
/// board all assume Esperanto meeting audio unless configured otherwise.
pub const SOURCE_LANGUAGE: &str = "eo";

/// Cloud session backoff bounds (exponential, jittered).
pub const CLOUD_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
pub const CLOUD_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// How long the cloud session waits for the start acknowledgement.
pub const CLOUD_START_TIMEOUT: Duration = Duration::from_secs(10);

/// How long draining waits for trailing finals after end-of-stream.
pub const CLOUD_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Audio replayed after a cloud reconnect to smooth utterance boundaries.
pub const CLOUD_REPLAY_WINDOW: Duration = Duration::from_secs(1);

/// Default short-lived token lifetime requested during token exchange.
pub const CLOUD_JWT_TTL_SECONDS: u64 = 3600;

/// Window length for the windowed local recognizer.
pub const LOCAL_LARGE_WINDOW_SECONDS: f64 = 6.0;

/// Minimum interval between successful caption posts.
pub const CAPTION_MIN_POST_INTERVAL_SECONDS: f64 = 1.0;

/// Caption POST retry backoff bounds and budget.
pub const CAPTION_RETRY_INITIAL: Duration = Duration::from_secs(1);
pub const CAPTION_RETRY_MAX: Duration = Duration::from_secs(15);
pub const CAPTION_MAX_FAILURES: u32 = 5;

/// Grace given to the caption worker to drain at shutdown.
pub const CAPTION_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Default caption board bind address.
pub const WEB_UI_HOST: &str = "127.0.0.1";
pub const WEB_UI_PORT: u16 = 8765;

/// Per-client outbound queue capacity on the caption board.
pub const WEB_CLIENT_QUEUE_CAPACITY: usize = 32;

/// Clients whose queue stays full this long are disconnected.
pub const WEB_CLIENT_STUCK_GRACE: Duration = Duration::from_secs(5);

/// Per-language translation request timeout.
pub const TRANSLATION_TIMEOUT_SECONDS: f64 = 8.0;

/// Translation cache size; entries expire after four request timeouts.
pub const TRANSLATION_CACHE_MAX_ENTRIES: usize = 128;

/// Webhook batch flush interval and size threshold.
pub const WEBHOOK_FLUSH_INTERVAL_SECONDS: f64 = 2.0;
pub const WEBHOOK_MAX_CHARS: usize = 350;

/// Hard cap on a single webhook message body; longer bodies are split into
/// sequential posts.
pub const WEBHOOK_HARD_CAP_CHARS: usize = 1900;

/// Webhook delivery retry backoff bounds and budget.
pub const WEBHOOK_RETRY_INITIAL: Duration = Duration::from_secs(1);
pub const WEBHOOK_RETRY_MAX: Duration = Duration::from_secs(10);
pub const WEBHOOK_MAX_ATTEMPTS: u32 = 5;

/// Default webhook display name.
pub const WEBHOOK_USERNAME: &str = "Esperanto STT";

/// Hard deadline for the whole shutdown sequence.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

/// Minimum gap between repeated failure log lines for one endpoint.
pub const FAILURE_LOG_COOLDOWN: Duration = Duration::from_secs(60);

/// Level monitor defaults: sustained input below the silence threshold or
/// above the clip threshold produces a warning, rate limited by the cooldown.
pub const LEVEL_SILENCE_THRESHOLD_DBFS: f64 = -45.0;
pub const LEVEL_SILENCE_DURATION_SECONDS: f64 = 10.0;
pub const LEVEL_CLIP_THRESHOLD_DBFS: f64 = -1.0;
pub const LEVEL_CLIP_HOLD_SECONDS: f64 = 3.0;
pub const LEVEL_WARNING_COOLDOWN: Duration = Duration::from_secs(15);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_math_is_consistent() {
        let samples_per_frame = (SAMPLE_RATE as f64 * CHUNK_DURATION_SECONDS) as usize;
        assert_eq!(samples_per_frame, 8000);
    }

    #[test]
    fn backoff_bounds_are_ordered() {
        assert!(BIND_RETRY_INITIAL < BIND_RETRY_MAX);
        assert!(CLOUD_BACKOFF_INITIAL < CLOUD_BACKOFF_MAX);
        assert!(CAPTION_RETRY_INITIAL < CAPTION_RETRY_MAX);
        assert!(WEBHOOK_RETRY_INITIAL < WEBHOOK_RETRY_MAX);
    }
}
