use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sigpatch")]
#[command(about = "Offline host for the signature scanning and patch installation engine")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Load and validate profiles
    Check {
        /// Profile files (.json or .toml)
        #[arg(short, long = "profile", required = true)]
        profiles: Vec<PathBuf>,
    },

    /// Fire the pipeline once against a captured memory image
    Simulate {
        /// Profile files (.json or .toml); the first is the default
        #[arg(short, long = "profile", required = true)]
        profiles: Vec<PathBuf>,

        /// Use the profile with this version instead of the default
        #[arg(long)]
        version: Option<String>,

        /// Captured memory image (JSON)
        #[arg(short, long)]
        image: PathBuf,

        /// Write the run report (state and diagnostics) as JSON
        #[arg(short, long)]
        report: Option<PathBuf>,

        /// Write the patched memory image
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Find every address in an image matching a signature
    Scan {
        /// Captured memory image (JSON)
        #[arg(short, long)]
        image: PathBuf,

        /// Signature such as "48 8D 0D ?? ?? ?? ??"
        #[arg(short, long)]
        pattern: String,

        /// Stop after this many matches
        #[arg(long, default_value = "32")]
        limit: usize,
    },
}
