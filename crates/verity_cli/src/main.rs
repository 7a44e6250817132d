//! VERITY.FABRIC CLI
//!
//! Replay verification, run diffs, determinism checks, policy evaluation and
//! integrity tools over a local run store.
//!
//! Exit codes: 0 match, 1 mismatch, 2 not found, 3 internal error.

#![warn(clippy::all)]

mod commands;
mod config;
mod logging;

use clap::Parser;
use color_eyre::eyre::Report;
use commands::Command;
use config::FabricConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use verity_core::{Classify, ErrorKind};
use verity_integrity::IntegrityError;
use verity_policy::PolicyError;
use verity_replay::ReplayError;
use verity_storage::StoreError;

#[derive(Parser)]
#[command(name = "verity")]
#[command(about = "VERITY.FABRIC - deterministic replay and verification", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); defaults to ./verity.toml when present
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Run store directory, overriding store.root
    #[arg(long, global = true)]
    store: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

/// Error class of the first classified error in the chain
fn classify(err: &Report) -> Option<ErrorKind> {
    err.chain().find_map(|cause| {
        if let Some(err) = cause.downcast_ref::<StoreError>() {
            Some(err.kind())
        } else if let Some(err) = cause.downcast_ref::<ReplayError>() {
            Some(err.kind())
        } else if let Some(err) = cause.downcast_ref::<PolicyError>() {
            Some(err.kind())
        } else {
            cause.downcast_ref::<IntegrityError>().map(Classify::kind)
        }
    })
}

pub(crate) fn exit_code_for(err: &Report) -> u8 {
    match classify(err) {
        Some(ErrorKind::NotFound) => 2,
        Some(ErrorKind::VersionMismatch | ErrorKind::IntegrityFailure | ErrorKind::ReplayDiverged) => 1,
        _ => 3,
    }
}

fn run(cli: Cli) -> color_eyre::Result<u8> {
    let mut config = FabricConfig::load(cli.config.as_deref())?;
    if let Some(root) = cli.store {
        config.store.root = root;
    }
    logging::init(&config.logging)?;
    tracing::debug!(engine_version = %config.engine_version, "configuration loaded");
    commands::run(cli.command, &config)
}

fn main() -> ExitCode {
    if let Err(err) = color_eyre::install() {
        eprintln!("failed to install error reporter: {err}");
        return ExitCode::from(3);
    }
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("Error: {err:?}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}
