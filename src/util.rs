// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Logging setup and signal handling collaborators.

use anyhow::Result;
use log::info;

/// Initialize the systemd journal logger.
///
/// # Errors
/// Returns an error if the journal logger fails to initialize.
pub fn init_logger(debug: bool) -> Result<()> {
    let log_level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    systemd_journal_logger::JournalLog::new()?.install()?;
    log::set_max_level(log_level);
    Ok(())
}

/// Shutdown signal received.
#[derive(Debug, Clone, Copy)]
pub enum ShutdownSignal {
    Sigint,
    Sigterm,
}

/// Wait for a shutdown signal (SIGINT or SIGTERM).
///
/// # Errors
/// Returns an error if signal handlers fail to initialize.
pub async fn wait_for_shutdown() -> Result<ShutdownSignal> {
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received");
            Ok(ShutdownSignal::Sigint)
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received");
            Ok(ShutdownSignal::Sigterm)
        }
    }
}

/// Ignore `SIGPIPE` so a write to a disconnected IPC client surfaces as an
/// `EPIPE` I/O error instead of terminating the process.
///
/// # Errors
/// Returns an error if the signal disposition cannot be changed.
pub fn ignore_sigpipe() -> Result<()> {
    unsafe {
        nix::sys::signal::signal(nix::sys::signal::Signal::SIGPIPE, nix::sys::signal::SigHandler::SigIgn)?;
    }
    Ok(())
}
