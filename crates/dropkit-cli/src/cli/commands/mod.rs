//! CLI commands implementation.
//!
//! This module contains the CLI parser and dispatches to command-specific modules.

mod burst;
mod profiles;
mod proxies;
mod status;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use dropkit::config::{LoadOptions, Settings};
use dropkit::RateLimitProfile;

#[derive(Parser)]
#[command(name = "dropkit")]
#[command(about = "Rate-limited purchase bursts across egress identities")]
#[command(version)]
pub struct Cli {
    /// Config file path (overrides auto-discovery)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Rate limiter profile
    #[arg(short, long, global = true, value_enum, env = "DROPKIT_PROFILE")]
    profile: Option<RateLimitProfile>,

    /// Data directory holding the snapshot database and proxies file
    #[arg(long, global = true, env = "DROPKIT_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Fire a burst of purchase attempts at one item
    Burst {
        /// Target as <collection>/<item>, e.g. 2/19
        target: String,
        /// Purchase URL; {collection} and {item} are substituted
        #[arg(short, long, env = "DROPKIT_URL_TEMPLATE")]
        url_template: String,
        /// Number of attempts to enqueue
        #[arg(short, long, default_value = "10")]
        attempts: u32,
        /// Milliseconds between enqueues (default from config)
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Seconds to wait for the burst to finish
        #[arg(long, default_value = "120")]
        timeout: u64,
        /// Fixed worker count (default: one per proxy, up to the maximum)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Proxies file (default: proxies.txt in the data directory)
        #[arg(long)]
        proxies: Option<PathBuf>,
        /// Response header carrying the number of units acquired
        #[arg(long)]
        units_header: Option<String>,
        /// Extra request header, as NAME:VALUE (repeatable)
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Show the persisted rate limit state
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
        /// Number of recent requests to show per scope
        #[arg(long, default_value = "5")]
        recent: usize,
    },

    /// List rate limiter profiles
    Profiles,

    /// List the egress identities a burst would use
    Proxies {
        /// Proxies file (default: proxies.txt in the data directory)
        #[arg(long)]
        proxies: Option<PathBuf>,
    },
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let options = LoadOptions {
        config_path: cli.config,
        profile: cli.profile,
        data_dir: cli.data_dir,
    };
    let settings = Settings::load(&options).await?;

    match cli.command {
        Commands::Burst {
            target,
            url_template,
            attempts,
            delay_ms,
            timeout,
            workers,
            proxies,
            units_header,
            headers,
        } => {
            burst::cmd_burst(
                &settings,
                burst::BurstArgs {
                    target,
                    url_template,
                    attempts,
                    delay_ms,
                    timeout,
                    workers,
                    proxies,
                    units_header,
                    headers,
                },
            )
            .await
        }
        Commands::Status { json, recent } => status::cmd_status(&settings, json, recent).await,
        Commands::Profiles => profiles::cmd_profiles(&settings),
        Commands::Proxies { proxies } => proxies::cmd_proxies(&settings, proxies.as_deref()),
    }
}
