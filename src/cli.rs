use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mixdown")]
#[command(author, version, about = "Audio effects pipeline orchestrator")]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a preset over one or more audio files
    Process {
        /// Preset to run (see `mixdown presets`)
        #[arg(short, long)]
        preset: String,

        /// Input binding as ROLE=PATH (e.g. voice_track=voice.wav)
        #[arg(short, long = "input", value_name = "ROLE=PATH", required = true)]
        inputs: Vec<String>,

        /// Preset parameter override as KEY=VALUE
        #[arg(long = "param", value_name = "KEY=VALUE")]
        params: Vec<String>,

        /// Where to write the result (defaults to the preset's file name)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Whole-run deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List available presets
    Presets {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check that required external tools are available
    CheckTools,

    /// Validate configuration file
    Validate {
        /// Config file to validate (uses default if not specified)
        config: Option<PathBuf>,
    },

    /// Display version information
    Version,
}

/// Split `KEY=VALUE`, rejecting empty keys.
pub fn split_pair(raw: &str) -> Option<(&str, &str)> {
    let (key, value) = raw.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}
