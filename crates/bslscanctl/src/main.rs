//! bslscan Control - CLI front end for the BSL scan engine.
//!
//! Runs scans with tokenization-failure retry, sweeps source trees and
//! inspects single files.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Version is embedded at build time
const VERSION: &str = env!("BSLSCAN_VERSION");

#[derive(Parser)]
#[command(name = "bslscanctl")]
#[command(about = "SonarQube scanner driver for 1C:Enterprise (BSL) sources", long_about = None)]
#[command(version = VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scan, retrying tokenization failures
    Scan {
        /// Job file (TOML)
        #[arg(long, default_value = "bslscan.toml")]
        config: PathBuf,

        /// Set a scanner property (key=value, repeatable, wins over the job file)
        #[arg(short = 'D', long = "define", value_name = "KEY=VALUE")]
        define: Vec<String>,

        /// Repair the source tree before the first attempt
        #[arg(long)]
        sweep: bool,

        /// With --sweep: report without writing
        #[arg(long)]
        dry_run: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Repair every .bsl/.os file under a directory
    Sweep {
        /// Source tree root
        path: PathBuf,

        /// Report what would change without writing
        #[arg(long)]
        dry_run: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show repair findings for one file
    Check {
        /// File to inspect
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Scan {
            config,
            define,
            sweep,
            dry_run,
            json,
        } => commands::scan(config, define, sweep, dry_run, json).await,
        Commands::Sweep { path, dry_run, json } => commands::sweep(path, dry_run, json).await,
        Commands::Check { file } => commands::check(file).await,
    }
}
