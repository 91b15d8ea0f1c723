//! Recognizer backend contract.
//!
//! A backend is a two-channel actor: it consumes PCM frames until the source
//! closes, emits ordered transcript events, and owns its own session and
//! reconnection state. The pipeline only observes the event stream.

use crate::defaults;
use crate::error::Result;
use crate::pipeline::queue::DropOldestQueue;
use crate::pipeline::types::{AudioFrame, TranscriptEvent};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::warn;

/// Frame input shared with the capture stream.
pub type FrameSource = Arc<DropOldestQueue<AudioFrame>>;

/// Ordered transcript event output.
///
/// The recognizer is authoritative and must not be lossy: when the channel
/// fills, `send` blocks. A block past the stall threshold is logged and
/// counted, then the send continues to completion.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<TranscriptEvent>,
    stalls: Arc<AtomicU64>,
}

impl EventSender {
    pub fn new(tx: mpsc::Sender<TranscriptEvent>) -> Self {
        Self {
            tx,
            stalls: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Deliver an event in order. Returns false once the pipeline has gone
    /// away and the backend should wind down.
    pub async fn send(&self, event: TranscriptEvent) -> bool {
        let send = self.tx.send(event);
        tokio::pin!(send);
        let mut warned = false;
        loop {
            tokio::select! {
                result = &mut send => return result.is_ok(),
                _ = tokio::time::sleep(defaults::EVENT_STALL_WARNING), if !warned => {
                    self.stalls.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Transcript event channel blocked for {:?}; pipeline is falling behind",
                        defaults::EVENT_STALL_WARNING,
                    );
                    warned = true;
                }
            }
        }
    }

    /// Stalls recorded since startup.
    pub fn stall_count(&self) -> u64 {
        self.stalls.load(Ordering::Relaxed)
    }
}

/// Trait for streaming speech recognizers.
///
/// This trait allows swapping implementations (cloud session, embedded
/// recognizer, windowed recognizer, or a mock).
#[async_trait]
pub trait TranscriptionBackend: Send + Sync {
    /// Consume frames until the source is closed, emitting transcript events
    /// in order. Returns once the input is drained and the last in-flight
    /// utterance has been finalized or the session abandoned. Transient
    /// failures are handled internally; an `Err` is fatal to the pipeline.
    async fn run(&self, frames: FrameSource, events: EventSender) -> Result<()>;

    /// Name for logging/diagnostics.
    fn name(&self) -> &'static str;
}

/// Scripted event for `MockBackend`: emitted after the backend has consumed
/// the given number of frames.
#[derive(Debug, Clone)]
pub struct ScriptedEvent {
    pub after_frames: u64,
    pub event: TranscriptEvent,
}

/// Mock backend for testing: replays scripted events as frames arrive.
#[derive(Debug, Clone, Default)]
pub struct MockBackend {
    script: Vec<ScriptedEvent>,
    fail_with: Option<String>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit `event` once `after_frames` frames have been consumed.
    pub fn with_event(mut self, after_frames: u64, event: TranscriptEvent) -> Self {
        self.script.push(ScriptedEvent {
            after_frames,
            event,
        });
        self
    }

    /// Configure the mock to return a fatal error after its script finishes.
    pub fn with_fatal_error(mut self, message: &str) -> Self {
        self.fail_with = Some(message.to_string());
        self
    }
}

#[async_trait]
impl TranscriptionBackend for MockBackend {
    async fn run(&self, frames: FrameSource, events: EventSender) -> Result<()> {
        let mut consumed: u64 = 0;
        let mut script = self.script.clone();

        loop {
            // Emit everything due at the current frame count, in order.
            while let Some(step) = script.first() {
                if step.after_frames > consumed {
                    break;
                }
                let step = script.remove(0);
                if !events.send(step.event).await {
                    return Ok(());
                }
            }

            match frames.pop().await {
                Some(_) => consumed += 1,
                None => break,
            }
        }

        // Input drained: flush any remaining scripted events.
        for step in script {
            if !events.send(step.event).await {
                return Ok(());
            }
        }

        match &self.fail_with {
            Some(message) => Err(crate::error::TranskriboError::BackendFatal {
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::FinalTranscript;

    fn partial(text: &str) -> TranscriptEvent {
        TranscriptEvent::Partial {
            text: text.to_string(),
            speaker: None,
            session_id: "sess-test".to_string(),
        }
    }

    fn final_event(text: &str) -> TranscriptEvent {
        TranscriptEvent::Final(FinalTranscript {
            text: text.to_string(),
            speaker: None,
            utterance_id: "utt-test".to_string(),
            started_at: None,
            ended_at: None,
            session_id: "sess-test".to_string(),
        })
    }

    fn frame() -> AudioFrame {
        AudioFrame::new(vec![0i16; 160], 16000, 0)
    }

    #[tokio::test]
    async fn test_mock_backend_replays_script_in_order() {
        let backend = MockBackend::new()
            .with_event(1, partial("Bonan"))
            .with_event(2, final_event("Bonan tagon."));

        let frames: FrameSource = Arc::new(DropOldestQueue::new(8));
        let (tx, mut rx) = mpsc::channel(16);
        let events = EventSender::new(tx);

        frames.push(frame());
        frames.push(frame());
        frames.close();

        backend.run(frames, events).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), partial("Bonan"));
        assert_eq!(rx.recv().await.unwrap(), final_event("Bonan tagon."));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_mock_backend_flushes_remaining_on_close() {
        let backend = MockBackend::new().with_event(100, final_event("late"));
        let frames: FrameSource = Arc::new(DropOldestQueue::new(8));
        let (tx, mut rx) = mpsc::channel(16);

        frames.close();
        backend.run(frames, EventSender::new(tx)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), final_event("late"));
    }

    #[tokio::test]
    async fn test_mock_backend_fatal_error() {
        let backend = MockBackend::new().with_fatal_error("auth rejected");
        let frames: FrameSource = Arc::new(DropOldestQueue::new(8));
        let (tx, _rx) = mpsc::channel(16);

        frames.close();
        let err = backend.run(frames, EventSender::new(tx)).await.unwrap_err();
        assert!(err.to_string().contains("auth rejected"));
    }

    #[tokio::test]
    async fn test_event_sender_counts_stalls() {
        let (tx, mut rx) = mpsc::channel(1);
        let events = EventSender::new(tx);

        assert!(events.send(partial("a")).await);
        assert_eq!(events.stall_count(), 0);

        // Channel is full; the send blocks until the consumer drains it.
        let sender = events.clone();
        let blocked = tokio::spawn(async move { sender.send(partial("b")).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        assert!(rx.recv().await.is_some());
        assert!(blocked.await.unwrap());
    }

    #[tokio::test]
    async fn test_event_sender_reports_closed_pipeline() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let events = EventSender::new(tx);
        assert!(!events.send(partial("a")).await);
    }
}
