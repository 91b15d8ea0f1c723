//! Embedded offline recognizer backend.
//!
//! Feeds capture frames straight into a locally loaded model and emits both
//! partial and final transcripts. The model is loaded once at startup from
//! `LOCAL_MODEL_PATH`; a missing path fails fast.
//!
//! # Feature Gate
//!
//! Requires the `vosk` feature and libvosk at link time:
//!
//! ```bash
//! cargo build --features vosk
//! ```

use crate::config::OfflineSettings;
use crate::error::{Result, TranskriboError};
use crate::stt::backend::{EventSender, FrameSource, TranscriptionBackend};
use async_trait::async_trait;

#[cfg(feature = "vosk")]
use crate::pipeline::types::{FinalTranscript, TranscriptEvent};
#[cfg(feature = "vosk")]
use std::sync::Mutex;
#[cfg(feature = "vosk")]
use tracing::{debug, warn};
#[cfg(feature = "vosk")]
use uuid::Uuid;
#[cfg(feature = "vosk")]
use vosk::{DecodingState, Model, Recognizer};

/// Decide what to do with a raw partial hypothesis.
///
/// Consecutive identical partials are suppressed, and one empty partial is
/// emitted when the recognizer clears its hypothesis so the caption board
/// can blank the pending line.
fn partial_to_emit(last_partial: &mut Option<String>, raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        if last_partial.is_some() {
            *last_partial = None;
            return Some(String::new());
        }
        return None;
    }
    if last_partial.as_deref() == Some(text) {
        return None;
    }
    *last_partial = Some(text.to_string());
    Some(text.to_string())
}

/// Offline recognizer backend.
#[cfg(feature = "vosk")]
pub struct OfflineBackend {
    // The model must outlive the recognizer.
    _model: Model,
    recognizer: Mutex<Recognizer>,
}

#[cfg(feature = "vosk")]
impl OfflineBackend {
    pub fn new(settings: &OfflineSettings, sample_rate: u32) -> Result<Self> {
        if !settings.model_path.exists() {
            return Err(TranskriboError::ModelNotFound {
                path: settings.model_path.display().to_string(),
            });
        }

        // Suppress verbose Kaldi logging
        vosk::set_log_level(vosk::LogLevel::Error);

        let path = settings.model_path.to_string_lossy().to_string();
        let model = Model::new(&path).ok_or_else(|| TranskriboError::BackendFatal {
            message: format!("failed to load offline model from {path} (LOCAL_MODEL_PATH)"),
        })?;
        let mut recognizer =
            Recognizer::new(&model, sample_rate as f32).ok_or_else(|| {
                TranskriboError::BackendFatal {
                    message: "failed to create offline recognizer".to_string(),
                }
            })?;
        recognizer.set_words(true);

        Ok(Self {
            _model: model,
            recognizer: Mutex::new(recognizer),
        })
    }
}

#[cfg(feature = "vosk")]
#[async_trait]
impl TranscriptionBackend for OfflineBackend {
    async fn run(&self, frames: FrameSource, events: EventSender) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();
        let mut last_partial: Option<String> = None;

        while let Some(frame) = frames.pop().await {
            let (finalized, partial_raw, final_raw) = {
                let mut recognizer = self
                    .recognizer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                match recognizer.accept_waveform(&frame.samples) {
                    Ok(DecodingState::Finalized) => {
                        let result = recognizer.result();
                        let single = result.single().map(|s| {
                            let started = s.result.first().map(|w| w.start as f64);
                            let ended = s.result.last().map(|w| w.end as f64);
                            (s.text.to_string(), started, ended)
                        });
                        (true, None, single)
                    }
                    Ok(_) => {
                        let partial = recognizer.partial_result().partial.to_string();
                        (false, Some(partial), None)
                    }
                    Err(e) => {
                        warn!("Offline recognizer rejected a frame: {e}");
                        continue;
                    }
                }
            };

            if finalized {
                if let Some((text, started_at, ended_at)) = final_raw {
                    let text = text.trim().to_string();
                    if !text.is_empty() {
                        last_partial = None;
                        let event = TranscriptEvent::Final(FinalTranscript {
                            text,
                            speaker: None,
                            utterance_id: Uuid::new_v4().to_string(),
                            started_at,
                            ended_at,
                            session_id: session_id.clone(),
                        });
                        if !events.send(event).await {
                            return Ok(());
                        }
                    }
                }
            } else if let Some(raw) = partial_raw {
                if let Some(text) = partial_to_emit(&mut last_partial, &raw) {
                    let event = TranscriptEvent::Partial {
                        text,
                        speaker: None,
                        session_id: session_id.clone(),
                    };
                    if !events.send(event).await {
                        return Ok(());
                    }
                }
            }
        }

        // Input drained: flush whatever the recognizer still holds.
        let flushed = {
            let mut recognizer = self
                .recognizer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let result = recognizer.final_result();
            result.single().map(|s| s.text.trim().to_string())
        };
        if let Some(text) = flushed {
            if !text.is_empty() {
                debug!("Flushing trailing offline transcript");
                let event = TranscriptEvent::Final(FinalTranscript {
                    text,
                    speaker: None,
                    utterance_id: Uuid::new_v4().to_string(),
                    started_at: None,
                    ended_at: None,
                    session_id,
                });
                events.send(event).await;
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local_offline"
    }
}

/// Offline recognizer placeholder (without the vosk feature).
#[cfg(not(feature = "vosk"))]
#[derive(Debug)]
pub struct OfflineBackend;

#[cfg(not(feature = "vosk"))]
impl OfflineBackend {
    pub fn new(_settings: &OfflineSettings, _sample_rate: u32) -> Result<Self> {
        Err(TranskriboError::BackendFatal {
            message: "this build does not include the local_offline backend; \
                      rebuild with --features vosk"
                .to_string(),
        })
    }
}

#[cfg(not(feature = "vosk"))]
#[async_trait]
impl TranscriptionBackend for OfflineBackend {
    async fn run(&self, _frames: FrameSource, _events: EventSender) -> Result<()> {
        Err(TranskriboError::BackendFatal {
            message: "local_offline backend unavailable in this build".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "local_offline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_dedupe_suppresses_repeats() {
        let mut last = None;
        assert_eq!(partial_to_emit(&mut last, "bonan"), Some("bonan".to_string()));
        assert_eq!(partial_to_emit(&mut last, "bonan"), None);
        assert_eq!(
            partial_to_emit(&mut last, "bonan tagon"),
            Some("bonan tagon".to_string())
        );
    }

    #[test]
    fn test_partial_clear_emitted_once() {
        let mut last = None;
        assert_eq!(partial_to_emit(&mut last, "bonan"), Some("bonan".to_string()));
        // Recognizer cleared its hypothesis: one empty partial resets the board.
        assert_eq!(partial_to_emit(&mut last, ""), Some(String::new()));
        assert_eq!(partial_to_emit(&mut last, ""), None);
    }

    #[test]
    fn test_partial_whitespace_treated_as_empty() {
        let mut last = None;
        assert_eq!(partial_to_emit(&mut last, "   "), None);
    }

    #[cfg(not(feature = "vosk"))]
    #[test]
    fn test_stub_fails_fast_with_actionable_message() {
        let settings = OfflineSettings {
            model_path: std::path::PathBuf::from("/models/eo"),
        };
        let err = OfflineBackend::new(&settings, 16000).unwrap_err();
        assert!(err.to_string().contains("--features vosk"));
    }

    #[cfg(feature = "vosk")]
    #[test]
    fn test_missing_model_path_fails_fast() {
        let settings = OfflineSettings {
            model_path: std::path::PathBuf::from("/nonexistent/model/dir"),
        };
        let err = OfflineBackend::new(&settings, 16000).unwrap_err();
        assert!(matches!(err, TranskriboError::ModelNotFound { .. }));
    }
}
