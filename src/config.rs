// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Daemon configuration: file defaults, environment overrides, CLI overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::warn;
use serde::{Deserialize, Serialize};

fn default_quarantine_root() -> PathBuf {
    PathBuf::from("/opt/quarantine")
}

fn default_scanner_socket() -> PathBuf {
    PathBuf::from("/var/run/clamav/clamd.ctl")
}

fn default_ipc_socket() -> PathBuf {
    env::temp_dir().join("sentinel.sock")
}

const fn default_worker_count() -> usize {
    4
}

const fn default_queue_capacity() -> usize {
    64
}

const fn default_max_clients() -> usize {
    32
}

/// Runtime configuration for the daemon.
///
/// Precedence when assembled by [`Config::load`]: file values, then
/// `SENTINEL_*` environment overrides, then explicit CLI overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub watch_roots: Vec<PathBuf>,
    #[serde(default = "default_quarantine_root")]
    pub quarantine_root: PathBuf,
    #[serde(default = "default_scanner_socket")]
    pub scanner_socket: PathBuf,
    #[serde(default = "default_ipc_socket")]
    pub ipc_socket: PathBuf,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    #[serde(skip)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            watch_roots: Vec::new(),
            quarantine_root: default_quarantine_root(),
            scanner_socket: default_scanner_socket(),
            ipc_socket: default_ipc_socket(),
            worker_count: default_worker_count(),
            queue_capacity: default_queue_capacity(),
            max_clients: default_max_clients(),
            debug: false,
        }
    }
}

/// Overrides supplied on the command line; `None` means "use file/env value".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub quarantine_root: Option<PathBuf>,
    pub ipc_socket: Option<PathBuf>,
    pub worker_count: Option<usize>,
    pub debug: bool,
}

impl Config {
    /// Load configuration from `config_path` (if present), apply `SENTINEL_*`
    /// environment overrides, then `cli` overrides.
    ///
    /// A missing config file falls back to defaults with a warning. A config
    /// file that exists but fails to parse is reported as an error to the
    /// caller, since a typo'd deployment file should not be silently ignored.
    ///
    /// # Errors
    /// Returns an error if the config file exists but cannot be parsed.
    pub fn load(config_path: &Path, cli: &CliOverrides) -> anyhow::Result<Self> {
        let mut config = match fs::read_to_string(config_path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                anyhow::anyhow!("config file {} is invalid: {e}", config_path.display())
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    "no config file at {}, using defaults",
                    config_path.display()
                );
                Self::default()
            }
            Err(e) => {
                warn!(
                    "could not read config file {}: {e}, using defaults",
                    config_path.display()
                );
                Self::default()
            }
        };

        config.apply_env();
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(v) = env::var("SENTINEL_QUARANTINE_ROOT") {
            self.quarantine_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SENTINEL_SCANNER_SOCKET") {
            self.scanner_socket = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SENTINEL_IPC_SOCKET") {
            self.ipc_socket = PathBuf::from(v);
        }
        if let Ok(v) = env::var("SENTINEL_WORKER_COUNT") {
            if let Ok(n) = v.parse() {
                self.worker_count = n;
            } else {
                warn!("SENTINEL_WORKER_COUNT={v:?} is not a valid integer, ignoring");
            }
        }
    }

    fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(root) = &cli.quarantine_root {
            self.quarantine_root = root.clone();
        }
        if let Some(socket) = &cli.ipc_socket {
            self.ipc_socket = socket.clone();
        }
        if let Some(n) = cli.worker_count {
            self.worker_count = n;
        }
        self.debug = cli.debug;
    }

    /// Validate logical constraints: watch roots must exist and be
    /// directories, numeric fields must be non-zero.
    ///
    /// # Errors
    /// Returns an error describing every violation found.
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut problems = Vec::new();

        for root in &self.watch_roots {
            if !root.is_dir() {
                problems.push(format!("watch root {} is not a directory", root.display()));
            }
        }
        if self.worker_count == 0 {
            problems.push("workerCount must be non-zero".to_string());
        }
        if self.queue_capacity == 0 {
            problems.push("queueCapacity must be non-zero".to_string());
        }
        if self.max_clients == 0 {
            problems.push("maxClients must be non-zero".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(anyhow::anyhow!("invalid configuration: {}", problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.queue_capacity, 64);
        assert_eq!(config.quarantine_root, PathBuf::from("/opt/quarantine"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/sentinel.json"), &CliOverrides::default())
            .expect("missing file is not an error");
        assert_eq!(config.worker_count, 4);
    }

    #[test]
    fn cli_override_takes_precedence() {
        let cli = CliOverrides {
            worker_count: Some(9),
            ..Default::default()
        };
        let config = Config::load(Path::new("/nonexistent/sentinel.json"), &cli).unwrap();
        assert_eq!(config.worker_count, 9);
    }

    #[test]
    fn rejects_nonexistent_watch_root() {
        let config = Config {
            watch_roots: vec![PathBuf::from("/nonexistent/path/for/sentinel/tests")],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
