//! Pipeline orchestration: capture → recognizer → fan-out.
//!
//! The pipeline is the single consumer of the recognizer's ordered event
//! stream. Partials go to the caption board only; finals are enriched with
//! translations and then dispatched to every sink from this one loop, so
//! all sinks observe finals in the same order. Sinks own their own queues
//! and delivery guarantees and never block the loop or each other.

use crate::audio::CaptureStream;
use crate::config::Settings;
use crate::defaults;
use crate::error::{Result, TranskriboError};
use crate::logging::FailureGate;
use crate::pipeline::text::normalize;
use crate::pipeline::types::{EnrichedFinal, FinalTranscript, TranscriptEvent};
use crate::sinks::{
    BroadcastMessage, CaptionPoster, CaptionWebServer, DiscordBatcher, TranscriptLog,
};
use crate::stt::{EventSender, TranscriptionBackend};
use crate::translate::TranslationService;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The downstream half of the pipeline, shared between the live event loop
/// and the shutdown drain.
struct SinkSet {
    translator: TranslationService,
    caption: CaptionPoster,
    transcript_log: TranscriptLog,
    discord: DiscordBatcher,
    web: Option<CaptionWebServer>,
}

impl SinkSet {
    async fn dispatch(&self, event: TranscriptEvent) {
        match event {
            TranscriptEvent::Partial { text, speaker, .. } => {
                // Partials exist only on the caption board.
                if let Some(web) = &self.web {
                    web.broadcast(&BroadcastMessage::Partial {
                        text: normalize(&text),
                        speaker,
                    });
                }
            }
            TranscriptEvent::Final(final_transcript) => {
                let text = normalize(&final_transcript.text);
                if text.is_empty() {
                    return;
                }
                let transcript = FinalTranscript {
                    text: text.clone(),
                    ..final_transcript
                };

                let translations = self.translator.translate(&text).await;

                // Observable progress on the terminal.
                info!("Final: {text}");

                // All sinks see finals in this dispatch order; each owns its
                // own delivery guarantees from here.
                self.caption.submit(&text);
                self.transcript_log.append(transcript.speaker.as_deref(), &text);
                if let Some(web) = &self.web {
                    web.broadcast(&BroadcastMessage::Final {
                        text: text.clone(),
                        speaker: transcript.speaker.clone(),
                        translations: translations.clone(),
                    });
                }
                self.discord.add(EnrichedFinal {
                    transcript,
                    translations,
                });
            }
        }
    }
}

pub struct Pipeline {
    settings: Settings,
}

impl Pipeline {
    pub fn new(settings: Settings) -> Self {
        Self { settings }
    }

    /// Run until the backend finishes or `shutdown` fires. Startup order:
    /// caption board, sink workers, recognizer, capture.
    pub async fn run(
        self,
        backend: Arc<dyn TranscriptionBackend>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let gate = Arc::new(FailureGate::new(defaults::FAILURE_LOG_COOLDOWN));
        let settings = self.settings;

        let web = if settings.web.enabled {
            let server = CaptionWebServer::start(&settings.web, &settings.translation).await?;
            if settings.web.open_browser {
                open_browser(&settings.web.host, server.port());
            }
            Some(server)
        } else {
            None
        };

        let sinks = SinkSet {
            translator: TranslationService::new(settings.translation.clone()),
            caption: CaptionPoster::spawn(settings.caption.clone(), Arc::clone(&gate)),
            transcript_log: TranscriptLog::spawn(&settings.transcript_log)?,
            discord: DiscordBatcher::spawn(
                settings.webhook.clone(),
                settings.translation.targets.clone(),
                Arc::clone(&gate),
            ),
            web,
        };

        let capture = CaptureStream::new(settings.audio.clone());
        let frames = capture.frames();
        let (event_tx, mut event_rx) = mpsc::channel(defaults::EVENT_CHANNEL_CAPACITY);
        let events = EventSender::new(event_tx);

        let backend_task = {
            let backend = Arc::clone(&backend);
            tokio::spawn(async move { backend.run(frames, events).await })
        };

        info!("Starting transcription pipeline with backend={}", backend.name());
        capture.start()?;

        // Event loop: runs until shutdown or until the backend closes its
        // event stream (fatal error or drained input).
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = event_rx.recv() => match event {
                    Some(event) => sinks.dispatch(event).await,
                    None => break,
                },
            }
        }

        // Bounded shutdown: stop producing, drain the recognizer, flush the
        // sinks in order, then tear the board down.
        let shutdown_sequence = async {
            capture.stop();
            let backend_result = backend_task.await;
            while let Some(event) = event_rx.recv().await {
                sinks.dispatch(event).await;
            }
            sinks.discord.close().await;
            sinks.transcript_log.close().await;
            sinks.caption.close().await;
            if let Some(web) = &sinks.web {
                web.stop();
            }
            backend_result
        };

        let backend_result =
            match tokio::time::timeout(defaults::SHUTDOWN_DEADLINE, shutdown_sequence).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "Shutdown did not complete within {:?}; abandoning remaining workers",
                        defaults::SHUTDOWN_DEADLINE,
                    );
                    if let Some(web) = &sinks.web {
                        web.stop();
                    }
                    return Ok(());
                }
            };

        let overflow = capture.overflow_count();
        if overflow > 0 {
            warn!("Capture dropped {overflow} frames to keep up with realtime");
        }
        info!("Transcription pipeline stopped");

        match backend_result {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(TranskriboError::Other(format!("backend task failed: {e}"))),
        }
    }
}

/// Best-effort browser launch for the caption board.
fn open_browser(host: &str, port: u16) {
    let url = format!("http://{host}:{port}");
    #[cfg(target_os = "macos")]
    let opener = "open";
    #[cfg(not(target_os = "macos"))]
    let opener = "xdg-open";

    match std::process::Command::new(opener).arg(&url).spawn() {
        Ok(_) => info!("Opened caption board at {url}"),
        Err(e) => warn!("Could not open a browser for {url}: {e}"),
    }
}
