//! Recognizer backends: one trait, three interchangeable variants.

pub mod backend;
pub mod cloud;
pub mod vosk;
pub mod whisper;

pub use self::backend::{EventSender, FrameSource, MockBackend, TranscriptionBackend};
pub use self::cloud::CloudBackend;
pub use self::vosk::OfflineBackend;
pub use self::whisper::WindowedBackend;

use crate::config::{BackendChoice, Settings};
use crate::error::{Result, TranskriboError};
use std::sync::Arc;

/// Construct the configured backend. The pipeline holds only the trait.
pub fn build_backend(settings: &Settings) -> Result<Arc<dyn TranscriptionBackend>> {
    match settings.backend {
        BackendChoice::Cloud => {
            let cloud = settings.cloud.clone().ok_or_else(|| {
                TranskriboError::ConfigMissingKey {
                    key: "CLOUD_API_KEY".to_string(),
                    hint: "required by the cloud backend".to_string(),
                }
            })?;
            Ok(Arc::new(CloudBackend::new(
                cloud,
                settings.audio.sample_rate,
                settings.audio.chunk_duration_seconds,
            )))
        }
        BackendChoice::LocalOffline => {
            let offline = settings.offline.as_ref().ok_or_else(|| {
                TranskriboError::ConfigMissingKey {
                    key: "LOCAL_MODEL_PATH".to_string(),
                    hint: "directory of the offline recognizer model".to_string(),
                }
            })?;
            Ok(Arc::new(OfflineBackend::new(
                offline,
                settings.audio.sample_rate,
            )?))
        }
        BackendChoice::LocalLarge => {
            let windowed = settings.windowed.as_ref().ok_or_else(|| {
                TranskriboError::ConfigMissingKey {
                    key: "LOCAL_LARGE_MODEL_SIZE".to_string(),
                    hint: "model size or path for the windowed recognizer".to_string(),
                }
            })?;
            Ok(Arc::new(WindowedBackend::new(
                windowed,
                settings.audio.sample_rate,
            )?))
        }
    }
}
