//! `reusejoin` - runs a repeated range-join experiment from a config file.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reusejoin::config::JoinConfig;
use reusejoin::driver;

/// In-memory hash join with cross-query hash table reuse
#[derive(Parser, Debug)]
#[command(name = "reusejoin", version)]
struct Args {
    /// Configuration file (TOML)
    config: PathBuf,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging();

    info!(path = %args.config.display(), "loading configuration");
    let config = JoinConfig::from_file(&args.config)
        .with_context(|| format!("cannot load {}", args.config.display()))?;

    let summary = driver::run(&config)?;
    let matches: u64 = summary.passes.iter().map(|p| p.matches).sum();
    let reused = summary.passes.iter().filter(|p| p.reused).count();
    info!(
        passes = summary.passes.len(),
        reused,
        matches,
        "done"
    );
    Ok(())
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stdout)
        .init();
}
