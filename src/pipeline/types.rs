//! Event types that flow between pipeline stages.

use std::collections::HashMap;
use std::time::Instant;

/// Fixed-duration mono PCM frame from the capture stream.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// 16-bit PCM samples at the pipeline sample rate.
    pub samples: Vec<i16>,
    pub sample_rate: u32,
    /// Strictly increasing within a capture session; resets to 0 on re-bind.
    pub frame_index: u64,
    /// Capture timestamp on the monotonic clock.
    pub captured_at: Instant,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32, frame_index: u64) -> Self {
        Self {
            samples,
            sample_rate,
            frame_index,
            captured_at: Instant::now(),
        }
    }

    /// Returns the duration of this frame in milliseconds.
    pub fn duration_ms(&self) -> u32 {
        (self.samples.len() as u32 * 1000) / self.sample_rate
    }

    /// Little-endian byte view for recognizers that consume raw PCM.
    pub fn to_pcm_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for sample in &self.samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        bytes
    }
}

/// A stable transcript produced by a recognizer backend.
#[derive(Debug, Clone, PartialEq)]
pub struct FinalTranscript {
    pub text: String,
    pub speaker: Option<String>,
    pub utterance_id: String,
    /// Utterance bounds in seconds on the recognizer's own clock, when the
    /// backend reports them.
    pub started_at: Option<f64>,
    pub ended_at: Option<f64>,
    pub session_id: String,
}

/// Transcript event emitted by a recognizer backend, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptEvent {
    /// Hypothesis; supersedes prior partials within the same session. Never
    /// logged or posted anywhere except the caption board broadcast.
    Partial {
        text: String,
        speaker: Option<String>,
        session_id: String,
    },
    /// Stable result; delivered to every enabled sink at most once.
    Final(FinalTranscript),
}

impl TranscriptEvent {
    pub fn is_final(&self) -> bool {
        matches!(self, TranscriptEvent::Final(_))
    }

    pub fn text(&self) -> &str {
        match self {
            TranscriptEvent::Partial { text, .. } => text,
            TranscriptEvent::Final(final_transcript) => &final_transcript.text,
        }
    }

    /// Extracts the final transcript if this is a Final variant.
    pub fn into_final(self) -> Option<FinalTranscript> {
        match self {
            TranscriptEvent::Final(final_transcript) => Some(final_transcript),
            TranscriptEvent::Partial { .. } => None,
        }
    }
}

/// A final transcript enriched with per-language translations. Languages
/// that failed to translate are absent from the map, never empty strings.
#[derive(Debug, Clone)]
pub struct EnrichedFinal {
    pub transcript: FinalTranscript,
    pub translations: HashMap<String, String>,
}

impl EnrichedFinal {
    pub fn without_translations(transcript: FinalTranscript) -> Self {
        Self {
            transcript,
            translations: HashMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_final(text: &str) -> FinalTranscript {
        FinalTranscript {
            text: text.to_string(),
            speaker: None,
            utterance_id: "utt-1".to_string(),
            started_at: Some(0.0),
            ended_at: Some(1.2),
            session_id: "sess-1".to_string(),
        }
    }

    #[test]
    fn test_frame_duration() {
        let frame = AudioFrame::new(vec![0i16; 8000], 16000, 0);
        assert_eq!(frame.duration_ms(), 500);
    }

    #[test]
    fn test_frame_pcm_bytes_little_endian() {
        let frame = AudioFrame::new(vec![1i16, -2], 16000, 0);
        assert_eq!(frame.to_pcm_bytes(), vec![0x01, 0x00, 0xfe, 0xff]);
    }

    #[test]
    fn test_event_variants() {
        let partial = TranscriptEvent::Partial {
            text: "Bonan".to_string(),
            speaker: None,
            session_id: "sess-1".to_string(),
        };
        assert!(!partial.is_final());
        assert_eq!(partial.text(), "Bonan");
        assert!(partial.into_final().is_none());

        let final_event = TranscriptEvent::Final(make_final("Bonan tagon."));
        assert!(final_event.is_final());
        assert_eq!(final_event.text(), "Bonan tagon.");
        assert_eq!(final_event.into_final().unwrap().text, "Bonan tagon.");
    }

    #[test]
    fn test_enriched_final_without_translations() {
        let enriched = EnrichedFinal::without_translations(make_final("Saluton."));
        assert!(enriched.translations.is_empty());
        assert_eq!(enriched.transcript.text, "Saluton.");
    }
}
