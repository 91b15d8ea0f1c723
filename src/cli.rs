//! Command-line interface for transkribo
//!
//! Provides argument parsing using clap derive macros.

use clap::Parser;
use std::path::PathBuf;

/// Realtime Esperanto meeting transcription with caption fan-out
#[derive(Parser, Debug)]
#[command(
    name = "transkribo",
    version,
    about = "Realtime Esperanto meeting transcription with caption fan-out"
)]
pub struct Cli {
    /// List audio devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Print the effective configuration (secrets masked) and exit
    #[arg(long)]
    pub show_config: bool,

    /// Run audio environment diagnostics and exit
    #[arg(long)]
    pub diagnose_audio: bool,

    /// Override the recognizer backend (cloud, local_offline, local_large)
    #[arg(long, value_name = "NAME")]
    pub backend: Option<String>,

    /// Override the process log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Override the process log file (default: stderr)
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// KEY=VALUE configuration file, overridden by environment variables
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}
