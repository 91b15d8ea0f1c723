//! Process-wide logging setup and failure-log rate limiting.

use crate::config::LoggingSettings;
use crate::error::{Result, TranskriboError};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

/// Initialise the tracing subscriber from `LOG_LEVEL` / `LOG_FILE`.
///
/// Defaults to human-readable output on stderr. A configured log file is
/// opened in append mode and receives the same lines without ANSI colour.
pub fn init(settings: &LoggingSettings) -> Result<()> {
    let filter = EnvFilter::try_new(settings.level.to_ascii_lowercase()).map_err(|e| {
        TranskriboError::ConfigInvalidValue {
            key: "LOG_LEVEL".to_string(),
            message: format!("{e}"),
        }
    })?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &settings.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            // try_init keeps repeated initialisation (tests) harmless.
            let _ = builder.with_ansi(false).with_writer(Arc::new(file)).try_init();
        }
        None => {
            let _ = builder.with_writer(std::io::stderr).try_init();
        }
    }
    Ok(())
}

/// Collapses repeated failure logs for the same endpoint to one line per
/// cooldown window. Sinks consult this before logging delivery errors so a
/// dead webhook does not flood the terminal.
pub struct FailureGate {
    cooldown: Duration,
    last_logged: Mutex<HashMap<String, Instant>>,
}

impl FailureGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_logged: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true when a failure for `endpoint` should be logged now.
    pub fn should_log(&self, endpoint: &str) -> bool {
        let mut last = self
            .last_logged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let now = Instant::now();
        match last.get(endpoint) {
            Some(previous) if now.duration_since(*previous) < self.cooldown => false,
            _ => {
                last.insert(endpoint.to_string(), now);
                true
            }
        }
    }

    /// Forget an endpoint after a success so the next failure logs at once.
    pub fn reset(&self, endpoint: &str) {
        let mut last = self
            .last_logged
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last.remove(endpoint);
    }
}
