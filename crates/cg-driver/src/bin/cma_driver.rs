//! Command-line entry point: one CMA-ES iteration per invocation.
//!
//! ```text
//! cg-cma-driver [--eps 0.1] state.in state.out
//! ```
//!
//! Reads the previous snapshot from `cma.internal_state.cur` (Running
//! transitions only) and writes the new one to `cma.internal_state.new`;
//! the pipeline promotes the latter before the next call.

use std::path::PathBuf;

use anyhow::Context;
use cg_driver::{DriverConfig, IterationDriver, DEFAULT_EPS, TEST_MODE_ENV};
use cg_optimizer::{CmaEvolutionStrategy, DEFAULT_SNAPSHOT_IN, DEFAULT_SNAPSHOT_OUT};
use clap::Parser;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Advance the CMA evolution strategy by one pipeline iteration.
#[derive(Parser, Debug)]
#[command(name = "cg-cma-driver", version, about)]
struct Cli {
    /// State file holding the evaluated trials (or the initial guess).
    input: PathBuf,

    /// State file to write the next candidates to.
    output: PathBuf,

    /// Initial step size, used on the Initialization transition only.
    #[arg(long, default_value_t = DEFAULT_EPS)]
    eps: f64,

    /// Candidates per iteration (default: 4 + floor(3 ln n)).
    #[arg(long)]
    popsize: Option<usize>,

    /// Snapshot written by the previous iteration.
    #[arg(long, default_value = DEFAULT_SNAPSHOT_IN)]
    snapshot_in: PathBuf,

    /// Where this iteration's snapshot is written.
    #[arg(long, default_value = DEFAULT_SNAPSHOT_OUT)]
    snapshot_out: PathBuf,

    /// Log level used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(cli.log_level).into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config = DriverConfig::new(&cli.input, &cli.output)
        .with_eps(cli.eps)
        .with_population_size(cli.popsize)
        .with_snapshot_paths(&cli.snapshot_in, &cli.snapshot_out)
        .with_test_mode_from_env();
    if config.seed.is_some() {
        tracing::info!(seed = ?config.seed, "{} is set, using a fixed seed", TEST_MODE_ENV);
    }

    let driver = IterationDriver::new(config).context("invalid driver configuration")?;
    driver
        .run::<CmaEvolutionStrategy>()
        .with_context(|| format!("iteration on {} failed", cli.input.display()))?;

    Ok(())
}
