//! Downstream consumers of final transcripts.
//!
//! Each sink owns its own worker, queue, and delivery guarantees; the
//! pipeline dispatches to all of them from a single event loop and never
//! blocks on any of them.

pub mod caption;
pub mod discord;
pub mod transcript_log;
pub mod webui;

pub use caption::CaptionPoster;
pub use discord::DiscordBatcher;
pub use transcript_log::TranscriptLog;
pub use webui::{BroadcastMessage, CaptionWebServer};
