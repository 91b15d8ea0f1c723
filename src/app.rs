//! Application entry point: CLI dispatch, pipeline bootstrap, exit codes.

use crate::audio;
use crate::cli::Cli;
use crate::config::Settings;
use crate::error::{Result, TranskriboError};
use crate::logging;
use crate::pipeline::Pipeline;
use crate::stt;
use clap::Parser;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Exit codes per the external contract.
pub const EXIT_OK: i32 = 0;
pub const EXIT_CONFIG: i32 = 2;
pub const EXIT_BACKEND: i32 = 3;
pub const EXIT_SIGINT: i32 = 130;

/// Parse the command line, run, and return the process exit code.
pub async fn run() -> i32 {
    let cli = Cli::parse();

    // Device tooling must work without a complete pipeline configuration.
    if cli.list_devices {
        return match list_devices_command() {
            Ok(()) => EXIT_OK,
            Err(e) => {
                eprintln!("{e}");
                EXIT_CONFIG
            }
        };
    }
    if cli.diagnose_audio {
        let audio_settings = load_settings(&cli)
            .map(|settings| settings.audio)
            .unwrap_or_default();
        return match audio::diagnose_report(&audio_settings) {
            Ok(report) => {
                print!("{report}");
                EXIT_OK
            }
            Err(e) => {
                eprintln!("{e}");
                EXIT_CONFIG
            }
        };
    }

    let settings = match load_settings(&cli) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return EXIT_CONFIG;
        }
    };

    if cli.show_config {
        return match settings.to_masked_json() {
            Ok(dump) => {
                println!("{dump}");
                EXIT_OK
            }
            Err(e) => {
                eprintln!("{e}");
                EXIT_CONFIG
            }
        };
    }

    if let Err(e) = logging::init(&settings.logging) {
        eprintln!("Configuration error: {e}");
        return EXIT_CONFIG;
    }

    match run_pipeline(settings).await {
        Ok(code) => code,
        Err(e) => {
            error!("{e}");
            exit_code_for(&e)
        }
    }
}

fn list_devices_command() -> Result<()> {
    for info in audio::list_devices()? {
        let marker = if info.is_default { "  (default)" } else { "" };
        println!("{:>3}: {}{marker}", info.index, info.name);
    }
    Ok(())
}

fn load_settings(cli: &Cli) -> Result<Settings> {
    let mut overrides: Vec<(&str, String)> = Vec::new();
    if let Some(backend) = &cli.backend {
        overrides.push(("TRANSCRIPTION_BACKEND", backend.clone()));
    }
    if let Some(level) = &cli.log_level {
        overrides.push(("LOG_LEVEL", level.clone()));
    }
    if let Some(file) = &cli.log_file {
        overrides.push(("LOG_FILE", file.display().to_string()));
    }
    Settings::load(cli.config.as_deref(), &overrides)
}

fn exit_code_for(error: &TranskriboError) -> i32 {
    if error.is_config_error() || matches!(error, TranskriboError::PortInUse { .. }) {
        EXIT_CONFIG
    } else {
        EXIT_BACKEND
    }
}

async fn run_pipeline(settings: Settings) -> Result<i32> {
    let backend = stt::build_backend(&settings)?;

    let shutdown = CancellationToken::new();
    let interrupted = Arc::new(AtomicBool::new(false));

    {
        let shutdown = shutdown.clone();
        let interrupted = Arc::clone(&interrupted);
        tokio::spawn(async move {
            if wait_for_stop_signal().await {
                interrupted.store(true, Ordering::SeqCst);
            }
            info!("Received stop signal, shutting down");
            shutdown.cancel();
        });
    }

    Pipeline::new(settings).run(backend, shutdown).await?;

    if interrupted.load(Ordering::SeqCst) {
        Ok(EXIT_SIGINT)
    } else {
        Ok(EXIT_OK)
    }
}

/// Wait for SIGINT or SIGTERM. Returns true for SIGINT (exit code 130).
#[cfg(unix)]
async fn wait_for_stop_signal() -> bool {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return true;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => true,
        _ = sigterm.recv() => false,
    }
}

#[cfg(not(unix))]
async fn wait_for_stop_signal() -> bool {
    let _ = tokio::signal::ctrl_c().await;
    true
}
