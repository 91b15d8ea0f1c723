//! Windowed local recognizer backend.
//!
//! Accumulates capture frames into fixed-duration windows and runs Whisper
//! inference on each window on the blocking thread pool. Emits finals only,
//! no partials. Each window is consumed whole, so finals never duplicate
//! across window boundaries.
//!
//! # Feature Gate
//!
//! This module requires the `whisper` feature and cmake to be installed:
//!
//! ```bash
//! cargo build --features whisper
//! ```

use crate::config::WindowedSettings;
use crate::error::{Result, TranskriboError};
use crate::stt::backend::{EventSender, FrameSource, TranscriptionBackend};
use async_trait::async_trait;

#[cfg(feature = "whisper")]
use crate::pipeline::types::{FinalTranscript, TranscriptEvent};
#[cfg(feature = "whisper")]
use std::path::Path;
#[cfg(feature = "whisper")]
use std::sync::{Arc, Mutex, Once};
#[cfg(feature = "whisper")]
use tracing::warn;
#[cfg(feature = "whisper")]
use uuid::Uuid;
#[cfg(feature = "whisper")]
use whisper_rs::{
    FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters, install_logging_hooks,
};

#[cfg(feature = "whisper")]
static LOGGING_HOOKS_INSTALLED: Once = Once::new();

/// Convert i16 audio samples to f32 normalized to [-1.0, 1.0].
///
/// Whisper expects audio in f32 format normalized to the range [-1.0, 1.0].
/// Input is 16-bit PCM audio where samples range from -32768 to 32767.
pub fn convert_audio(samples: &[i16]) -> Vec<f32> {
    samples
        .iter()
        .map(|&sample| sample as f32 / 32768.0)
        .collect()
}

/// Windowed recognizer backend.
#[cfg(feature = "whisper")]
pub struct WindowedBackend {
    recognizer: Arc<WindowedRecognizer>,
    window_samples: usize,
    sample_rate: u32,
}

/// Model context plus inference settings, shared with blocking workers.
#[cfg(feature = "whisper")]
struct WindowedRecognizer {
    context: Mutex<WhisperContext>,
    language: String,
}

#[cfg(feature = "whisper")]
impl WindowedRecognizer {
    fn transcribe(&self, samples: &[i16]) -> Result<String> {
        let audio = convert_audio(samples);

        let context = self
            .context
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut state = context
            .create_state()
            .map_err(|e| TranskriboError::Backend {
                message: format!("failed to create inference state: {e}"),
            })?;

        let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
        params.set_language(Some(&self.language));
        params.set_print_special(false);
        params.set_print_progress(false);
        params.set_print_realtime(false);
        params.set_print_timestamps(false);

        state.full(params, &audio).map_err(|e| TranskriboError::Backend {
            message: format!("inference failed: {e}"),
        })?;

        let mut transcription = String::new();
        for segment in state.as_iter() {
            if let Ok(text) = segment.to_str_lossy() {
                if !transcription.is_empty() && !text.starts_with(' ') {
                    transcription.push(' ');
                }
                transcription.push_str(&text);
            }
        }
        Ok(transcription.trim().to_string())
    }
}

#[cfg(feature = "whisper")]
impl WindowedBackend {
    /// Check if a model path points to an English-only model.
    fn is_english_only_model(path: &Path) -> bool {
        path.file_stem()
            .and_then(|s| s.to_str())
            .map(|stem| stem.ends_with(".en"))
            .unwrap_or(false)
    }

    pub fn new(settings: &WindowedSettings, sample_rate: u32) -> Result<Self> {
        // Install logging hooks to suppress whisper.cpp output (only once)
        LOGGING_HOOKS_INSTALLED.call_once(|| {
            install_logging_hooks();
        });

        if !settings.model_path.exists() {
            return Err(TranskriboError::ModelNotFound {
                path: settings.model_path.display().to_string(),
            });
        }

        if Self::is_english_only_model(&settings.model_path) && settings.language != "en" {
            warn!(
                "Model '{}' is English-only but the configured language is '{}'",
                settings.model_path.display(),
                settings.language,
            );
        }

        let mut context_params = WhisperContextParameters::default();
        context_params.flash_attn(true);
        let path_str =
            settings
                .model_path
                .to_str()
                .ok_or_else(|| TranskriboError::ModelNotFound {
                    path: settings.model_path.display().to_string(),
                })?;
        let context = WhisperContext::new_with_params(path_str, context_params).map_err(|e| {
            TranskriboError::BackendFatal {
                message: format!(
                    "failed to load model from {} (LOCAL_LARGE_MODEL_PATH): {e}",
                    settings.model_path.display(),
                ),
            }
        })?;

        let window_samples =
            ((sample_rate as f64 * settings.window_seconds).round() as usize).max(1);

        Ok(Self {
            recognizer: Arc::new(WindowedRecognizer {
                context: Mutex::new(context),
                language: settings.language.clone(),
            }),
            window_samples,
            sample_rate,
        })
    }

    /// Transcribe one window on the blocking pool and emit a final.
    async fn emit_window(
        &self,
        window: Vec<i16>,
        processed_samples: &mut u64,
        session_id: &str,
        events: &EventSender,
    ) -> Result<bool> {
        let window_len = window.len() as u64;
        let started_at = *processed_samples as f64 / self.sample_rate as f64;
        *processed_samples += window_len;
        let ended_at = *processed_samples as f64 / self.sample_rate as f64;

        let recognizer = Arc::clone(&self.recognizer);
        let text = tokio::task::spawn_blocking(move || recognizer.transcribe(&window))
            .await
            .map_err(|e| TranskriboError::Backend {
                message: format!("inference task panicked: {e}"),
            })?;

        let text = match text {
            Ok(text) => text,
            Err(e) => {
                // A failed window is lost audio, not a dead backend.
                warn!("Window transcription failed: {e}");
                return Ok(true);
            }
        };
        if text.is_empty() {
            return Ok(true);
        }

        let event = TranscriptEvent::Final(FinalTranscript {
            text,
            speaker: None,
            utterance_id: Uuid::new_v4().to_string(),
            started_at: Some(started_at),
            ended_at: Some(ended_at),
            session_id: session_id.to_string(),
        });
        Ok(events.send(event).await)
    }
}

#[cfg(feature = "whisper")]
#[async_trait]
impl TranscriptionBackend for WindowedBackend {
    async fn run(&self, frames: FrameSource, events: EventSender) -> Result<()> {
        let session_id = Uuid::new_v4().to_string();
        let mut buffer: Vec<i16> = Vec::with_capacity(self.window_samples);
        let mut processed_samples: u64 = 0;

        while let Some(frame) = frames.pop().await {
            buffer.extend_from_slice(&frame.samples);
            while buffer.len() >= self.window_samples {
                let window: Vec<i16> = buffer.drain(..self.window_samples).collect();
                if !self
                    .emit_window(window, &mut processed_samples, &session_id, &events)
                    .await?
                {
                    return Ok(());
                }
            }
        }

        // Input drained: flush the remaining partial window as one last final.
        if !buffer.is_empty() {
            self.emit_window(buffer, &mut processed_samples, &session_id, &events)
                .await?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "local_large"
    }
}

/// Windowed recognizer placeholder (without the whisper feature).
#[cfg(not(feature = "whisper"))]
#[derive(Debug)]
pub struct WindowedBackend;

#[cfg(not(feature = "whisper"))]
impl WindowedBackend {
    pub fn new(_settings: &WindowedSettings, _sample_rate: u32) -> Result<Self> {
        Err(TranskriboError::BackendFatal {
            message: "this build does not include the local_large backend; \
                      rebuild with --features whisper (requires cmake)"
                .to_string(),
        })
    }
}

#[cfg(not(feature = "whisper"))]
#[async_trait]
impl TranscriptionBackend for WindowedBackend {
    async fn run(&self, _frames: FrameSource, _events: EventSender) -> Result<()> {
        Err(TranskriboError::BackendFatal {
            message: "local_large backend unavailable in this build".to_string(),
        })
    }

    fn name(&self) -> &'static str {
        "local_large"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_audio_normalizes_range() {
        let samples = vec![0i16, i16::MAX, i16::MIN];
        let converted = convert_audio(&samples);
        assert_eq!(converted[0], 0.0);
        assert!((converted[1] - 0.99997).abs() < 0.001);
        assert_eq!(converted[2], -1.0);
    }

    #[test]
    fn test_convert_audio_empty() {
        assert!(convert_audio(&[]).is_empty());
    }

    #[cfg(feature = "whisper")]
    #[test]
    fn test_is_english_only_model() {
        assert!(WindowedBackend::is_english_only_model(Path::new(
            "models/ggml-base.en.bin"
        )));
        assert!(!WindowedBackend::is_english_only_model(Path::new(
            "models/ggml-base.bin"
        )));
    }

    #[cfg(feature = "whisper")]
    #[test]
    fn test_missing_model_fails_fast() {
        let settings = WindowedSettings {
            model_path: std::path::PathBuf::from("/nonexistent/model.bin"),
            language: "eo".to_string(),
            window_seconds: 6.0,
        };
        let err = WindowedBackend::new(&settings, 16000).unwrap_err();
        assert!(matches!(err, TranskriboError::ModelNotFound { .. }));
    }

    #[cfg(not(feature = "whisper"))]
    #[test]
    fn test_stub_fails_fast_with_actionable_message() {
        let settings = WindowedSettings {
            model_path: std::path::PathBuf::from("models/ggml-medium.bin"),
            language: "eo".to_string(),
            window_seconds: 6.0,
        };
        let err = WindowedBackend::new(&settings, 16000).unwrap_err();
        assert!(err.to_string().contains("--features whisper"));
    }
}
