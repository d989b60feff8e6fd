// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Quarantine manifest store: atomic isolate/restore/delete with a
//! JSON-backed manifest and strict permission-transition ordering.
//!
//! All operations serialize on a single mutex; the manifest is always
//! written by full replacement rather than incremental patching.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};
use nix::errno::Errno;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::QuarantineError;

const MANIFEST_FILE: &str = ".manifest.json";
const LOCKED_MODE: u32 = 0o000;
const RESTORED_MODE: u32 = 0o644;
const READ_ONLY_MODE: u32 = 0o400;

/// A single quarantined file, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEntry {
    pub id: String,
    pub original_path: PathBuf,
    pub quarantine_path: PathBuf,
    pub threat_name: String,
    pub timestamp: u64,
}

fn new_identifier() -> String {
    Uuid::new_v4().to_string()
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn truncate_threat_name(threat: &str) -> String {
    if threat.len() <= 255 {
        threat.to_string()
    } else {
        threat.chars().take(255).collect()
    }
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

fn io_err(path: &Path, source: io::Error) -> QuarantineError {
    QuarantineError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Move `from` to `to`, falling back to copy+unlink when the rename fails
/// because the paths live on different filesystems (`EXDEV`).
fn move_file(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(Errno::EXDEV as i32) => {
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

struct Inner {
    root: PathBuf,
    entries: Vec<QuarantineEntry>,
}

impl Inner {
    fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    fn persist(&self) -> Result<(), QuarantineError> {
        let path = self.manifest_path();
        let json = serde_json::to_string_pretty(&self.entries).unwrap_or_else(|_| "[]".to_string());
        fs::write(&path, json).map_err(|source| QuarantineError::ManifestWrite { path, source })
    }

    fn find(&self, id: &str) -> Option<&QuarantineEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

/// The quarantine manifest store (C2).
pub struct QuarantineStore {
    inner: Mutex<Inner>,
}

impl QuarantineStore {
    /// Create the quarantine root if missing and load (or reinitialize) the
    /// manifest. Orphan files under the root that have no manifest entry are
    /// counted and warned about, never deleted.
    ///
    /// # Errors
    /// Returns an error if the root directory cannot be created.
    pub fn init(root: impl Into<PathBuf>) -> Result<Self, QuarantineError> {
        let root = root.into();

        if !root.exists() {
            fs::create_dir_all(&root).map_err(|source| QuarantineError::RootInit {
                path: root.clone(),
                source,
            })?;
            set_mode(&root, 0o700).map_err(|source| QuarantineError::RootInit {
                path: root.clone(),
                source,
            })?;
        }

        let manifest_path = root.join(MANIFEST_FILE);
        let entries = match fs::read_to_string(&manifest_path) {
            Ok(contents) => serde_json::from_str::<Vec<QuarantineEntry>>(&contents).unwrap_or_else(|e| {
                warn!("manifest at {} is malformed ({e}), reinitializing", manifest_path.display());
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };

        let store = Self {
            inner: Mutex::new(Inner { root: root.clone(), entries }),
        };
        store.warn_on_orphans(&root);
        Ok(store)
    }

    fn warn_on_orphans(&self, root: &Path) {
        let inner = self.inner.lock().unwrap();
        let known: std::collections::HashSet<&Path> =
            inner.entries.iter().map(|e| e.quarantine_path.as_path()).collect();

        let Ok(read_dir) = fs::read_dir(root) else {
            return;
        };
        let orphans = read_dir
            .flatten()
            .filter(|entry| entry.file_name() != MANIFEST_FILE)
            .filter(|entry| !known.contains(entry.path().as_path()))
            .count();

        if orphans > 0 {
            warn!("{orphans} file(s) under quarantine root have no manifest entry; leaving them in place");
        }
    }

    /// Strip permissions on `path`, move it into the quarantine root at
    /// `0000`, and record a new manifest entry.
    ///
    /// # Errors
    /// Returns an error if the file cannot be moved or the manifest cannot
    /// be persisted.
    pub fn quarantine(&self, path: &Path, threat: &str) -> Result<QuarantineEntry, QuarantineError> {
        set_mode(path, LOCKED_MODE).map_err(|source| io_err(path, source))?;

        let mut inner = self.inner.lock().unwrap();
        let id = new_identifier();
        let basename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string());
        let qpath = inner.root.join(format!("{id}_{basename}"));

        if let Err(e) = move_file(path, &qpath) {
            // Cross-device copy needs a readable source; briefly restore
            // read permission, then reapply the lockdown on the source.
            let _ = set_mode(path, READ_ONLY_MODE);
            let copy_result = fs::copy(path, &qpath).and_then(|_| fs::remove_file(path));
            let _ = set_mode(path, LOCKED_MODE);
            copy_result.map_err(|_| io_err(path, e))?;
        }

        set_mode(&qpath, LOCKED_MODE).map_err(|source| io_err(&qpath, source))?;

        let entry = QuarantineEntry {
            id,
            original_path: path.to_path_buf(),
            quarantine_path: qpath,
            threat_name: truncate_threat_name(threat),
            timestamp: now_unix(),
        };
        inner.entries.push(entry.clone());
        inner.persist()?;
        info!("quarantined {} ({})", path.display(), entry.threat_name);
        Ok(entry)
    }

    /// Restore a previously quarantined file to its original path.
    ///
    /// # Errors
    /// Returns an error if the id is unknown or the file cannot be moved
    /// back; the quarantined file is re-locked on any move failure.
    pub fn restore(&self, id: &str) -> Result<QuarantineEntry, QuarantineError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .find(id)
            .cloned()
            .ok_or_else(|| QuarantineError::NotFound(id.to_string()))?;

        set_mode(&entry.quarantine_path, READ_ONLY_MODE)
            .map_err(|source| io_err(&entry.quarantine_path, source))?;

        match move_file(&entry.quarantine_path, &entry.original_path) {
            Ok(()) => {
                set_mode(&entry.original_path, RESTORED_MODE)
                    .map_err(|source| io_err(&entry.original_path, source))?;
                inner.entries.retain(|e| e.id != id);
                inner.persist()?;
                info!("restored {} to {}", id, entry.original_path.display());
                Ok(entry)
            }
            Err(e) => {
                let _ = set_mode(&entry.quarantine_path, LOCKED_MODE);
                Err(io_err(&entry.quarantine_path, e))
            }
        }
    }

    /// Permanently delete a quarantined file and its manifest entry.
    ///
    /// # Errors
    /// Returns an error if the id is unknown or the file cannot be unlinked.
    pub fn delete(&self, id: &str) -> Result<QuarantineEntry, QuarantineError> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .find(id)
            .cloned()
            .ok_or_else(|| QuarantineError::NotFound(id.to_string()))?;

        set_mode(&entry.quarantine_path, RESTORED_MODE)
            .map_err(|source| io_err(&entry.quarantine_path, source))?;
        fs::remove_file(&entry.quarantine_path).map_err(|source| io_err(&entry.quarantine_path, source))?;

        inner.entries.retain(|e| e.id != id);
        inner.persist()?;
        info!("deleted quarantine entry {id}");
        Ok(entry)
    }

    /// Snapshot of all current entries, in manifest order.
    pub fn list(&self) -> Vec<QuarantineEntry> {
        self.inner.lock().unwrap().entries.clone()
    }

    /// Flush the manifest to disk. Called during orderly shutdown.
    ///
    /// # Errors
    /// Returns an error if the manifest cannot be written.
    pub fn shutdown(&self) -> Result<(), QuarantineError> {
        self.inner.lock().unwrap().persist()
    }
}
