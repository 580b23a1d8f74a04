//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "voicebridge",
    version,
    about = "Real-time voice agent platform bridging telephony media to an STT/LLM/TTS pipeline"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the platform
    Run {
        /// Path to the configuration file
        #[arg(short, long, env = "VOICEBRIDGE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show {
        /// Path to the configuration file
        #[arg(short, long, env = "VOICEBRIDGE_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Print the default configuration as TOML
    Default,
}
