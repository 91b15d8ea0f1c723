//! Append-only transcript file.
//!
//! The log component owns the file handle; the pipeline sends it lines over
//! a channel so writes are serialized without a shared lock. Write errors
//! are logged and never fatal.

use crate::config::TranscriptLogSettings;
use crate::error::Result;
use std::fs::OpenOptions;
use std::io::Write;
use tokio::sync::mpsc;
use tracing::{info, warn};

struct LogLine {
    timestamp: String,
    speaker: Option<String>,
    text: String,
}

pub struct TranscriptLog {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<LogLine>>>,
    worker: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TranscriptLog {
    /// Open the file and start the writer. Disabled settings yield a no-op
    /// log; an unopenable path is a startup error.
    pub fn spawn(settings: &TranscriptLogSettings) -> Result<Self> {
        let Some(path) = settings.path.as_ref().filter(|_| settings.is_active()) else {
            return Ok(Self {
                tx: std::sync::Mutex::new(None),
                worker: std::sync::Mutex::new(None),
            });
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(!settings.overwrite)
            .truncate(settings.overwrite)
            .write(true)
            .open(path)?;
        info!(
            "Transcript logging to {} ({})",
            path.display(),
            if settings.overwrite { "overwrite" } else { "append" },
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(writer_loop(file, rx));
        Ok(Self {
            tx: std::sync::Mutex::new(Some(tx)),
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    /// Queue one final for persistence. Never blocks.
    pub fn append(&self, speaker: Option<&str>, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        let line = LogLine {
            timestamp: chrono::Local::now().format("%Y-%m-%dT%H:%M:%S").to_string(),
            speaker: speaker.map(str::to_string),
            text: text.trim().to_string(),
        };
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(tx) = tx.as_ref() {
            let _ = tx.send(line);
        }
    }

    /// Drain pending lines and close the file.
    pub async fn close(&self) {
        // The writer exits once every sender is gone.
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

async fn writer_loop(mut file: std::fs::File, mut rx: mpsc::UnboundedReceiver<LogLine>) {
    while let Some(line) = rx.recv().await {
        let rendered = format_line(&line.timestamp, line.speaker.as_deref(), &line.text);
        if let Err(e) = file.write_all(rendered.as_bytes()).and_then(|_| file.flush()) {
            warn!("Transcript log write failed: {e}");
        }
    }
}

/// `<ISO-8601 timestamp> [<speaker|"-">] <text>\n`
fn format_line(timestamp: &str, speaker: Option<&str>, text: &str) -> String {
    format!("{timestamp} [{}] {text}\n", speaker.unwrap_or("-"))
}
