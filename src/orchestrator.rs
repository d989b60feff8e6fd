// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle wiring and startup/shutdown ordering (C7).
//!
//! Owns every subsystem explicitly rather than relying on process-wide
//! singletons: configuration, the quarantine store, the scanner client, the
//! work queue, the ingestor thread, the worker pool, and the IPC server are
//! all values constructed here and passed down, not reached for globally.
//!
//! The ingestor and worker pool run on plain OS threads, outside any async
//! runtime, while the IPC server is async. Events cross that boundary over
//! an unbounded channel: workers push with a synchronous, non-blocking
//! `send`, and a single forwarder task drains it into the IPC broadcast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};
use tokio::sync::{mpsc, Notify};

use crate::config::Config;
use crate::error::SentinelError;
use crate::ipc::protocol::Event;
use crate::ipc::IpcServer;
use crate::pipeline::{PipelineEvent, PipelineOutcome, ScanPipeline};
use crate::quarantine::QuarantineStore;
use crate::queue::WorkQueue;
use crate::scanner::{ClamAVScanner, VirusScanner};
use crate::util;
use crate::watcher::Ingestor;

/// Construct every subsystem from `config` and run until a shutdown signal
/// arrives, then tear down in the order mandated by the concurrency model:
/// stop the ingestor, drain the work queue, broadcast a final status, close
/// the IPC server, scanner, and quarantine store.
///
/// # Errors
/// Returns an error if any subsystem fails to initialize.
pub async fn run(config: Config) -> Result<(), SentinelError> {
    let _ = util::ignore_sigpipe();

    let quarantine = Arc::new(QuarantineStore::init(&config.quarantine_root)?);
    let scanner: Arc<dyn VirusScanner> = Arc::new(ClamAVScanner::new(&config.scanner_socket));
    if scanner.ping() {
        info!("scanner available at {}", config.scanner_socket.display());
    } else {
        warn!(
            "scanner unreachable at {}; files will lock down until it returns",
            config.scanner_socket.display()
        );
    }

    let queue = Arc::new(WorkQueue::new(config.queue_capacity));
    let ipc = Arc::new(IpcServer::new(config.max_clients));
    let running = Arc::new(AtomicBool::new(true));
    let shutdown_notify = Arc::new(Notify::new());
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Event>();

    let workers = spawn_workers(
        &config,
        Arc::clone(&queue),
        Arc::clone(&scanner),
        Arc::clone(&quarantine),
        Arc::clone(&running),
        event_tx,
    );
    let ingestor_handle = spawn_ingestor(&config, Arc::clone(&queue), Arc::clone(&running))?;

    let forwarder_task = tokio::spawn({
        let ipc = Arc::clone(&ipc);
        async move {
            while let Some(event) = event_rx.recv().await {
                ipc.broadcast(&event).await;
            }
        }
    });

    let ipc_task = tokio::spawn({
        let ipc = Arc::clone(&ipc);
        let quarantine = Arc::clone(&quarantine);
        let socket_path = config.ipc_socket.clone();
        let shutdown_notify = Arc::clone(&shutdown_notify);
        async move {
            if let Err(e) = ipc.run(&socket_path, quarantine, shutdown_notify).await {
                error!("IPC server stopped with error: {e}");
            }
        }
    });

    match util::wait_for_shutdown().await {
        Ok(signal) => info!("received {signal:?}, shutting down"),
        Err(e) => error!("signal handler error: {e}, shutting down anyway"),
    }

    shutdown(ShutdownHandles {
        running,
        ingestor_handle,
        queue,
        workers,
        ipc,
        shutdown_notify,
        ipc_task,
        forwarder_task,
        quarantine,
    })
    .await;
    Ok(())
}

fn spawn_ingestor(
    config: &Config,
    queue: Arc<WorkQueue>,
    running: Arc<AtomicBool>,
) -> Result<thread::JoinHandle<()>, SentinelError> {
    let mut ingestor = Ingestor::new()?;
    for root in &config.watch_roots {
        ingestor.add_recursive(root);
    }

    Ok(thread::spawn(move || {
        ingestor.run(&running, |path| {
            queue.submit(path);
        });
    }))
}

fn spawn_workers(
    config: &Config,
    queue: Arc<WorkQueue>,
    scanner: Arc<dyn VirusScanner>,
    quarantine: Arc<QuarantineStore>,
    running: Arc<AtomicBool>,
    event_tx: mpsc::UnboundedSender<Event>,
) -> Vec<thread::JoinHandle<()>> {
    (0..config.worker_count)
        .map(|_| {
            let queue = Arc::clone(&queue);
            let pipeline = ScanPipeline::new(
                Arc::clone(&scanner),
                Arc::clone(&quarantine),
                config.quarantine_root.clone(),
                Arc::clone(&running),
            );
            let event_tx = event_tx.clone();
            thread::spawn(move || worker_loop(&queue, &pipeline, &event_tx))
        })
        .collect()
}

fn worker_loop(queue: &WorkQueue, pipeline: &ScanPipeline, event_tx: &mpsc::UnboundedSender<Event>) {
    while let Some(path) = queue.take() {
        let outcome = pipeline.process(&path, |event| {
            // UnboundedSender::send is synchronous; safe to call from a
            // plain OS thread with no Tokio runtime context.
            let _ = event_tx.send(to_broadcast_event(event));
        });
        log_outcome(&outcome);
    }
}

fn to_broadcast_event(event: PipelineEvent) -> Event {
    match event {
        PipelineEvent::Retrying { path } => {
            Event::status(&format!("scanner offline, retrying {}", path.display()))
        }
        PipelineEvent::Clean { path } => Event::scan_clean(&path.to_string_lossy()),
        PipelineEvent::Quarantined { path, threat, .. } => {
            Event::scan_threat(&path.to_string_lossy(), &threat)
        }
        PipelineEvent::Locked { path, reason } => {
            Event::status(&format!("{reason}: {}", path.display()))
        }
    }
}

fn log_outcome(outcome: &PipelineOutcome) {
    match outcome {
        PipelineOutcome::Dropped => {}
        PipelineOutcome::Clean { path } => info!("clean: {}", path.display()),
        PipelineOutcome::Quarantined { path, threat } => {
            info!("quarantined: {} ({threat})", path.display());
        }
        PipelineOutcome::QuarantineFailed { path } => {
            warn!("quarantine failed, locked: {}", path.display());
        }
        PipelineOutcome::Locked { path, reason } => {
            warn!("locked: {} ({reason})", path.display());
        }
        PipelineOutcome::Vanished { path } => {
            info!("vanished before verdict: {}", path.display());
        }
        PipelineOutcome::Aborted { path } => {
            info!("retry aborted by shutdown, locked: {}", path.display());
        }
    }
}

struct ShutdownHandles {
    running: Arc<AtomicBool>,
    ingestor_handle: thread::JoinHandle<()>,
    queue: Arc<WorkQueue>,
    workers: Vec<thread::JoinHandle<()>>,
    ipc: Arc<IpcServer>,
    shutdown_notify: Arc<Notify>,
    ipc_task: tokio::task::JoinHandle<()>,
    forwarder_task: tokio::task::JoinHandle<()>,
    quarantine: Arc<QuarantineStore>,
}

async fn shutdown(handles: ShutdownHandles) {
    let ShutdownHandles {
        running,
        ingestor_handle,
        queue,
        workers,
        ipc,
        shutdown_notify,
        ipc_task,
        forwarder_task,
        quarantine,
    } = handles;

    // Stop the ingestor first: no new submissions once it exits.
    running.store(false, Ordering::SeqCst);
    if ingestor_handle.join().is_err() {
        warn!("ingestor thread panicked during shutdown");
    }

    // Drain and shut down the work queue: in-flight scans complete.
    queue.shutdown();
    for worker in workers {
        if worker.join().is_err() {
            warn!("worker thread panicked during shutdown");
        }
    }

    // Final status broadcast, then drain the IPC write path.
    ipc.broadcast(&Event::status("shutting down")).await;
    shutdown_notify.notify_waiters();
    let _ = ipc_task.await;
    drop(ipc);
    let _ = forwarder_task.await;

    if let Err(e) = quarantine.shutdown() {
        error!("failed to flush manifest during shutdown: {e}");
    }

    info!("shutdown complete");
}
