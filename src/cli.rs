//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Search, inspect and download serialized novels from rule-configured
/// sites.
#[derive(Parser, Debug)]
#[command(name = "harvester")]
#[command(author, version, about)]
pub struct Cli {
    /// Increase output verbosity (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Config file (key = value lines); defaults to
    /// $XDG_CONFIG_HOME/harvester/config.toml
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// JSON file of source rules
    #[arg(long, global = true, value_name = "FILE")]
    pub rules: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Search every enabled source
    Search {
        keyword: String,

        /// Maximum number of results (1-200)
        #[arg(long, default_value_t = 20, value_parser = clap::value_parser!(u16).range(1..=200))]
        max: u16,
    },

    /// Show a book's metadata
    Detail(SourceArgs),

    /// List a book's chapters
    Toc {
        #[command(flatten)]
        target: SourceArgs,

        /// First chapter (1-based)
        #[arg(long)]
        start: Option<u32>,

        /// Last chapter (inclusive)
        #[arg(long)]
        end: Option<u32>,
    },

    /// Show one chapter's text
    Chapter(SourceArgs),

    /// Download a whole book
    Download(DownloadArgs),

    /// List configured sources
    Sources,

    /// Cache maintenance
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SourceArgs {
    /// Page URL
    pub url: String,

    /// Source rule id
    #[arg(short, long)]
    pub source: String,
}

#[derive(Args, Debug, Clone)]
pub struct DownloadArgs {
    #[command(flatten)]
    pub target: SourceArgs,

    /// Output format
    #[arg(long, default_value = "txt")]
    pub format: String,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// First chapter (1-based)
    #[arg(long)]
    pub start: Option<u32>,

    /// Last chapter (inclusive)
    #[arg(long)]
    pub end: Option<u32>,

    /// Chapters fetched concurrently per batch (1-100)
    #[arg(short = 'b', long, value_parser = clap::value_parser!(u16).range(1..=100))]
    pub batch_size: Option<u16>,

    /// Retries per chapter (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub retries: Option<u8>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum CacheAction {
    /// Remove expired entries from both tiers
    Sweep,

    /// Remove entries whose label matches a glob (`toc:*`, `*:biquge:*`)
    Invalidate { pattern: String },

    /// Print cache counters
    Stats,
}
