// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Recursive filesystem ingestor (C4).
//!
//! Runs on a dedicated OS thread, polling the inotify descriptor with a
//! short timeout so the loop can observe a cooperative stop flag. Unlike a
//! debounced watcher, every qualifying event is dispatched immediately —
//! the scan pipeline, not the ingestor, owns any notion of "settled".

use std::collections::HashMap;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use log::{debug, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

const POLL_TIMEOUT_MS: u16 = 500;

fn watch_mask() -> WatchMask {
    WatchMask::CLOSE_WRITE | WatchMask::CREATE | WatchMask::MOVED_TO
}

/// Recursive inotify-based filesystem ingestor.
pub struct Ingestor {
    inotify: Inotify,
    watches: HashMap<WatchDescriptor, PathBuf>,
    watch_limit_warned: bool,
}

impl Ingestor {
    /// # Errors
    /// Returns an error if the inotify instance cannot be initialized.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            inotify: Inotify::init()?,
            watches: HashMap::new(),
            watch_limit_warned: false,
        })
    }

    /// Recursively subscribe to `root` and every subdirectory reachable from
    /// it, skipping dotfile-named entries. A subscription failing with
    /// `ENOSPC` (the kernel watch-count limit) is logged once and does not
    /// abort the walk.
    pub fn add_recursive(&mut self, root: &Path) {
        let mut stack = vec![root.to_path_buf()];
        while let Some(dir) = stack.pop() {
            self.add_watch(&dir);
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                if is_dotfile(&entry.file_name()) {
                    continue;
                }
                if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                    stack.push(entry.path());
                }
            }
        }
    }

    fn add_watch(&mut self, dir: &Path) {
        match self.inotify.watches().add(dir, watch_mask()) {
            Ok(wd) => {
                self.watches.insert(wd, dir.to_path_buf());
            }
            Err(e) if e.raw_os_error() == Some(Errno::ENOSPC as i32) => {
                if !self.watch_limit_warned {
                    warn!(
                        "inotify watch limit reached; raise fs.inotify.max_user_watches to watch all configured directories"
                    );
                    self.watch_limit_warned = true;
                }
            }
            Err(e) => {
                warn!("failed to watch {}: {e}", dir.display());
            }
        }
    }

    /// Run the event loop until `running` is cleared, invoking `on_file`
    /// for every existing regular file that qualifies.
    pub fn run(&mut self, running: &Arc<AtomicBool>, mut on_file: impl FnMut(PathBuf)) {
        let fd = self.inotify.as_raw_fd();
        let mut buffer = [0u8; 4096];

        while running.load(Ordering::SeqCst) {
            let mut fds = [PollFd::new(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN)];
            let poll_result = poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS));
            match poll_result {
                Ok(0) | Err(_) => continue,
                Ok(_) => {}
            }

            // Copy out what's needed before releasing the borrow on
            // `self.inotify`, since handling an event needs `&mut self.watches`.
            let pending: Vec<(WatchDescriptor, EventMask, Option<std::ffi::OsString>)> =
                match self.inotify.read_events(&mut buffer) {
                    Ok(events) => events
                        .map(|e| (e.wd, e.mask, e.name.map(std::ffi::OsStr::to_os_string)))
                        .collect(),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                    Err(e) => {
                        warn!("inotify read error: {e}");
                        continue;
                    }
                };

            let mut new_dirs = Vec::new();
            for (wd, mask, name) in pending {
                self.handle_event(&wd, mask, name.as_deref(), &mut new_dirs, &mut on_file);
            }
            for dir in new_dirs {
                self.add_recursive(&dir);
            }
        }
    }

    fn handle_event(
        &mut self,
        wd: &WatchDescriptor,
        mask: EventMask,
        name: Option<&std::ffi::OsStr>,
        new_dirs: &mut Vec<PathBuf>,
        on_file: &mut impl FnMut(PathBuf),
    ) {
        let Some(name) = name else {
            return;
        };
        if name.is_empty() || is_dotfile(name) {
            return;
        }
        let Some(parent) = self.watches.get(wd) else {
            return;
        };
        let path = parent.join(name);

        let is_dir_event = mask.contains(EventMask::ISDIR);
        let is_new_or_moved_in =
            mask.contains(EventMask::CREATE) || mask.contains(EventMask::MOVED_TO);

        if is_dir_event && is_new_or_moved_in {
            new_dirs.push(path);
            return;
        }
        if is_dir_event {
            return;
        }

        match fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                debug!("ingestor dispatching {}", path.display());
                on_file(path);
            }
            _ => {}
        }
    }
}

fn is_dotfile(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_dotfile_detects_leading_dot() {
        assert!(is_dotfile(std::ffi::OsStr::new(".hidden")));
        assert!(!is_dotfile(std::ffi::OsStr::new("visible.txt")));
    }

    #[test]
    fn add_recursive_skips_dotfile_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join(".git")).unwrap();
        fs::create_dir(dir.path().join("src")).unwrap();

        let mut ingestor = Ingestor::new().unwrap();
        ingestor.add_recursive(dir.path());

        let watched: Vec<&PathBuf> = ingestor.watches.values().collect();
        assert!(watched.iter().any(|p| p.ends_with("src") || *p == dir.path()));
        assert!(!watched.iter().any(|p| p.ends_with(".git")));
    }
}
