// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-file scan-quarantine-alert state machine (C5).
//!
//! Every dequeued path passes through this pipeline exactly once. The
//! guiding posture is fail-closed: any outcome other than a positive clean
//! verdict ends with the file locked at mode `0000`, and that lockdown is
//! never reversed here — only an explicit restore command does that.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::quarantine::QuarantineStore;
use crate::scanner::{ScanReport, VirusScanner};

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(2);
const RETRY_POLL_INTERVAL: Duration = Duration::from_millis(200);
const MIN_SIZE: u64 = 4;
const MAX_SIZE: u64 = 100 * 1024 * 1024;

const TRANSIENT_NAME_PATTERNS: &[&str] = &[
    "clamav-",
    "-scantemp",
    "chromecrx_",
    ".org.chromium.",
    ".goutputstream",
];

const STRIPPED_MODE_MASK: u32 = !0o111;
const LOCKED_MODE: u32 = 0o000;

/// Outcome of running one path through the pipeline, for observability and
/// IPC broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Dropped,
    Clean {
        path: PathBuf,
    },
    Quarantined {
        path: PathBuf,
        threat: String,
    },
    QuarantineFailed {
        path: PathBuf,
    },
    Locked {
        path: PathBuf,
        reason: &'static str,
    },
    Vanished {
        path: PathBuf,
    },
    Aborted {
        path: PathBuf,
    },
}

/// Reject paths the pipeline should never act on: inside the quarantine
/// root, dotfile basenames, known transient tool-temp names, non-regular
/// files, or outside the accepted size range.
fn pre_filter(path: &Path, quarantine_root: &Path) -> bool {
    if path.starts_with(quarantine_root) {
        return false;
    }
    let Some(basename) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
        return false;
    };
    if basename.starts_with('.') {
        return false;
    }
    if TRANSIENT_NAME_PATTERNS.iter().any(|pat| basename.contains(pat)) {
        return false;
    }
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    let size = meta.len();
    (MIN_SIZE..=MAX_SIZE).contains(&size)
}

fn current_mode(path: &Path) -> u32 {
    fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o777)
        .unwrap_or(0o644)
}

fn set_mode(path: &Path, mode: u32) {
    let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
}

/// Drives one path through `Entry -> Stripped -> Verdict`.
pub struct ScanPipeline {
    scanner: Arc<dyn VirusScanner>,
    quarantine: Arc<QuarantineStore>,
    quarantine_root: PathBuf,
    running: Arc<AtomicBool>,
}

impl ScanPipeline {
    pub fn new(
        scanner: Arc<dyn VirusScanner>,
        quarantine: Arc<QuarantineStore>,
        quarantine_root: PathBuf,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            scanner,
            quarantine,
            quarantine_root,
            running,
        }
    }

    /// Sleep for `RETRY_DELAY`, re-checking `running` every
    /// `RETRY_POLL_INTERVAL` so a shutdown is observed within one poll
    /// interval instead of after the full delay. Returns `true` if shutdown
    /// was observed and the retry should be abandoned.
    fn sleep_or_abort(&self) -> bool {
        let mut remaining = RETRY_DELAY;
        while remaining > Duration::ZERO {
            if !self.running.load(Ordering::SeqCst) {
                return true;
            }
            let step = remaining.min(RETRY_POLL_INTERVAL);
            thread::sleep(step);
            remaining -= step;
        }
        !self.running.load(Ordering::SeqCst)
    }

    /// Run one path through the pipeline. Never panics and never returns an
    /// error — every exit path is terminal at this boundary, with the
    /// fail-closed lockdown applied whenever a clean verdict wasn't reached.
    pub fn process(&self, path: &Path, mut on_event: impl FnMut(PipelineEvent)) -> PipelineOutcome {
        if !pre_filter(path, &self.quarantine_root) {
            return PipelineOutcome::Dropped;
        }

        let orig_mode = current_mode(path);
        set_mode(path, orig_mode & STRIPPED_MODE_MASK);

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                if !path.exists() {
                    return PipelineOutcome::Vanished { path: path.to_path_buf() };
                }
                on_event(PipelineEvent::Retrying { path: path.to_path_buf() });
                if self.sleep_or_abort() {
                    set_mode(path, LOCKED_MODE);
                    on_event(PipelineEvent::Locked {
                        path: path.to_path_buf(),
                        reason: "shutdown requested, locked",
                    });
                    return PipelineOutcome::Aborted { path: path.to_path_buf() };
                }
            }

            match self.scanner.scan(path) {
                Ok(ScanReport::Clean) => {
                    set_mode(path, orig_mode);
                    on_event(PipelineEvent::Clean { path: path.to_path_buf() });
                    return PipelineOutcome::Clean { path: path.to_path_buf() };
                }
                Ok(ScanReport::Infected(threat)) => {
                    return self.handle_infected(path, &threat, on_event);
                }
                Ok(ScanReport::ScannerError) => {
                    set_mode(path, LOCKED_MODE);
                    on_event(PipelineEvent::Locked {
                        path: path.to_path_buf(),
                        reason: "scan error, locked",
                    });
                    return PipelineOutcome::Locked {
                        path: path.to_path_buf(),
                        reason: "scan error, locked",
                    };
                }
                Err(e) => {
                    warn!("transport error scanning {}: {e}", path.display());
                }
            }
        }

        set_mode(path, LOCKED_MODE);
        on_event(PipelineEvent::Locked {
            path: path.to_path_buf(),
            reason: "scanner offline, locked",
        });
        PipelineOutcome::Locked {
            path: path.to_path_buf(),
            reason: "scanner offline, locked",
        }
    }

    fn handle_infected(
        &self,
        path: &Path,
        threat: &str,
        mut on_event: impl FnMut(PipelineEvent),
    ) -> PipelineOutcome {
        match self.quarantine.quarantine(path, threat) {
            Ok(entry) => {
                info!("quarantined {} ({})", path.display(), threat);
                on_event(PipelineEvent::Quarantined {
                    path: path.to_path_buf(),
                    threat: threat.to_string(),
                    id: entry.id,
                });
                PipelineOutcome::Quarantined {
                    path: path.to_path_buf(),
                    threat: threat.to_string(),
                }
            }
            Err(e) => {
                warn!("quarantine failed for {}: {e}", path.display());
                set_mode(path, LOCKED_MODE);
                on_event(PipelineEvent::Locked {
                    path: path.to_path_buf(),
                    reason: "quarantine failed — locked",
                });
                PipelineOutcome::QuarantineFailed { path: path.to_path_buf() }
            }
        }
    }
}

/// Event emitted during pipeline execution, destined for the IPC broadcast.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Retrying { path: PathBuf },
    Clean { path: PathBuf },
    Quarantined { path: PathBuf, threat: String, id: String },
    Locked { path: PathBuf, reason: &'static str },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FixedScanner(ScanReport);
    impl VirusScanner for FixedScanner {
        fn scan(&self, _path: &Path) -> Result<ScanReport, TransportError> {
            Ok(self.0.clone())
        }
        fn ping(&self) -> bool {
            true
        }
    }

    struct AlwaysDownScanner;
    impl VirusScanner for AlwaysDownScanner {
        fn scan(&self, _path: &Path) -> Result<ScanReport, TransportError> {
            Err(TransportError::UnparseableReply("offline".to_string()))
        }
        fn ping(&self) -> bool {
            false
        }
    }

    struct CountingFlakyScanner(AtomicUsize);
    impl VirusScanner for CountingFlakyScanner {
        fn scan(&self, _path: &Path) -> Result<ScanReport, TransportError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(TransportError::UnparseableReply("offline".to_string()))
        }
        fn ping(&self) -> bool {
            false
        }
    }

    fn quarantine_in(dir: &tempfile::TempDir) -> Arc<QuarantineStore> {
        Arc::new(QuarantineStore::init(dir.path().join("quarantine")).unwrap())
    }

    fn touch(path: &Path, contents: &[u8]) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(contents).unwrap();
    }

    fn always_running() -> Arc<AtomicBool> {
        Arc::new(AtomicBool::new(true))
    }

    #[test]
    fn clean_verdict_leaves_file_in_place_with_original_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("a.txt");
        touch(&target, b"hello");
        fs::set_permissions(&target, fs::Permissions::from_mode(0o644)).unwrap();

        let pipeline = ScanPipeline::new(
            Arc::new(FixedScanner(ScanReport::Clean)),
            quarantine_in(&dir),
            dir.path().join("quarantine"),
            always_running(),
        );
        let outcome = pipeline.process(&target, |_| {});

        assert_eq!(outcome, PipelineOutcome::Clean { path: target.clone() });
        assert!(target.exists());
        assert_eq!(current_mode(&target), 0o644);
    }

    #[test]
    fn infected_verdict_quarantines_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("e.com");
        touch(&target, b"X5O!P%@AP[4\\PZX54(P^)7CC)7}$EICAR");

        let quarantine = quarantine_in(&dir);
        let pipeline = ScanPipeline::new(
            Arc::new(FixedScanner(ScanReport::Infected("Win.Test.EICAR_HDB-1".to_string()))),
            Arc::clone(&quarantine),
            dir.path().join("quarantine"),
            always_running(),
        );
        pipeline.process(&target, |_| {});

        assert!(!target.exists());
        let entries = quarantine.list();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].threat_name, "Win.Test.EICAR_HDB-1");
        assert_eq!(current_mode(&entries[0].quarantine_path), 0o000);
    }

    #[test]
    fn scanner_offline_locks_file_after_all_retries() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("x.bin");
        touch(&target, b"1234");

        let scanner = Arc::new(CountingFlakyScanner(AtomicUsize::new(0)));
        let pipeline = ScanPipeline::new(
            Arc::clone(&scanner) as Arc<dyn VirusScanner>,
            quarantine_in(&dir),
            dir.path().join("quarantine"),
            always_running(),
        );
        let events = StdMutex::new(Vec::new());
        let outcome = pipeline.process(&target, |e| events.lock().unwrap().push(e));

        assert!(matches!(outcome, PipelineOutcome::Locked { .. }));
        assert_eq!(current_mode(&target), 0o000);
        assert_eq!(scanner.0.load(Ordering::SeqCst), (MAX_RETRIES + 1) as usize);
    }

    #[test]
    fn shutdown_during_retry_sleep_aborts_within_one_poll_interval() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("y.bin");
        touch(&target, b"1234");

        let scanner = Arc::new(CountingFlakyScanner(AtomicUsize::new(0)));
        let running = always_running();
        let pipeline = ScanPipeline::new(
            Arc::clone(&scanner) as Arc<dyn VirusScanner>,
            quarantine_in(&dir),
            dir.path().join("quarantine"),
            Arc::clone(&running),
        );

        let running_clone = Arc::clone(&running);
        let stopper = thread::spawn(move || {
            thread::sleep(RETRY_POLL_INTERVAL * 2);
            running_clone.store(false, Ordering::SeqCst);
        });

        let started = std::time::Instant::now();
        let outcome = pipeline.process(&target, |_| {});
        stopper.join().unwrap();

        assert_eq!(outcome, PipelineOutcome::Aborted { path: target.clone() });
        assert_eq!(current_mode(&target), 0o000);
        assert!(
            started.elapsed() < RETRY_DELAY,
            "abort should cut the retry short instead of sleeping the full delay"
        );
    }

    #[test]
    fn tiny_file_is_dropped_by_prefilter() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("tiny.bin");
        touch(&target, b"ab");

        let pipeline = ScanPipeline::new(
            Arc::new(AlwaysDownScanner),
            quarantine_in(&dir),
            dir.path().join("quarantine"),
            always_running(),
        );
        let outcome = pipeline.process(&target, |_| {});
        assert_eq!(outcome, PipelineOutcome::Dropped);
        assert_eq!(current_mode(&target), 0o644);
    }

    #[test]
    fn dotfile_is_dropped_by_prefilter() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join(".hidden");
        touch(&target, b"hello world");

        let pipeline = ScanPipeline::new(
            Arc::new(FixedScanner(ScanReport::Clean)),
            quarantine_in(&dir),
            dir.path().join("quarantine"),
            always_running(),
        );
        assert_eq!(pipeline.process(&target, |_| {}), PipelineOutcome::Dropped);
    }

    #[test]
    fn transient_tool_name_is_dropped_by_prefilter() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("clamav-abc123-scantemp");
        touch(&target, b"hello world");

        let pipeline = ScanPipeline::new(
            Arc::new(FixedScanner(ScanReport::Clean)),
            quarantine_in(&dir),
            dir.path().join("quarantine"),
            always_running(),
        );
        assert_eq!(pipeline.process(&target, |_| {}), PipelineOutcome::Dropped);
    }
}
