// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Error types shared across components.

use std::path::PathBuf;

use thiserror::Error;

/// Failure connecting to or speaking with the antivirus engine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("cannot reach scanner at {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error talking to scanner: {0}")]
    Io(#[from] std::io::Error),

    #[error("scanner reply did not contain OK, FOUND, or ERROR: {0:?}")]
    UnparseableReply(String),
}

/// Failure in a quarantine store operation.
#[derive(Debug, Error)]
pub enum QuarantineError {
    #[error("no quarantine entry with id {0}")]
    NotFound(String),

    #[error("failed to create quarantine root {path}: {source}")]
    RootInit {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem operation on {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to persist manifest at {path}: {source}")]
    ManifestWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure initializing or running a top-level subsystem.
#[derive(Debug, Error)]
pub enum SentinelError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("quarantine store init failed: {0}")]
    Quarantine(#[from] QuarantineError),

    #[error("IPC server init failed: {path}: {source}")]
    IpcBind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("filesystem ingestor init failed: {0}")]
    Ingestor(#[from] std::io::Error),

    #[error("signal handler install failed: {0}")]
    Signal(String),
}
