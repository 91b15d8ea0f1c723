//! Pipeline core: event types, bounded queues, and the orchestrator that
//! drives capture → recognizer → fan-out.

pub mod orchestrator;
pub mod queue;
pub mod text;
pub mod types;

pub use orchestrator::Pipeline;
pub use queue::{DropOldestQueue, PushOutcome};
pub use types::{AudioFrame, EnrichedFinal, FinalTranscript, TranscriptEvent};
