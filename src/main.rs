// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! `sentineld` entry point: argument parsing, configuration assembly, and
//! handoff to the orchestrator.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::error;

use sentinel::config::{CliOverrides, Config};
use sentinel::orchestrator;
use sentinel::util;

#[derive(Parser)]
#[command(name = "sentineld", about = "Endpoint file-integrity and antivirus daemon")]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, default_value = "/etc/sentinel/config.json")]
    config: PathBuf,

    /// Override the quarantine root directory.
    #[arg(long)]
    quarantine_root: Option<PathBuf>,

    /// Override the IPC socket path.
    #[arg(long)]
    ipc_socket: Option<PathBuf>,

    /// Override the worker pool size.
    #[arg(long)]
    worker_count: Option<usize>,

    /// Enable debug-level logging.
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate configuration, then exit without starting the daemon.
    Verify,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = util::init_logger(cli.debug) {
        eprintln!("failed to initialize logger: {e}");
        return ExitCode::FAILURE;
    }

    let overrides = CliOverrides {
        quarantine_root: cli.quarantine_root.clone(),
        ipc_socket: cli.ipc_socket.clone(),
        worker_count: cli.worker_count,
        debug: cli.debug,
    };

    let config = match Config::load(&cli.config, &overrides) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };

    if matches!(cli.command, Some(Command::Verify)) {
        println!("configuration at {} is valid", cli.config.display());
        return ExitCode::SUCCESS;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(orchestrator::run(config)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal error: {e}");
            ExitCode::FAILURE
        }
    }
}
