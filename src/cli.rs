//! Command-line interface for Voxpost
//!
//! Handles argument parsing and logging configuration.

use clap::{Parser, Subcommand};
use log::LevelFilter;
use std::path::PathBuf;

/// Voxpost - record and play short voice clips
#[derive(Parser, Debug)]
#[command(name = "voxpost")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (defaults to ~/.config/voxpost/config.json)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Bearer token for the backend
    #[arg(long, env = "VOXPOST_TOKEN", hide_env_values = true, global = true)]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Record a clip until Ctrl-C or the recording ceiling
    Record {
        /// Where to write the WAV file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Upload the clip as a new post
        #[arg(long)]
        upload: bool,

        /// Upload the clip as a comment on this post
        #[arg(long, value_name = "POST_ID")]
        comment_on: Option<String>,

        /// Text sent along with the clip
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Play a URL, backend path or local file
    Play {
        source: String,

        /// Treat SOURCE as a post id and play that post's clip
        #[arg(long)]
        post: bool,

        /// Volume in [0, 1]; defaults to the last used volume
        #[arg(long)]
        volume: Option<f32>,
    },

    /// Print the effective configuration
    Config,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("voxpost", args.log_level());

    // Network and codec crates only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("reqwest", args.log_level());
        builder.filter_module("hyper", args.log_level());
        builder.filter_module("symphonia", args.log_level());
    }

    builder.format_timestamp_millis().init();
}
