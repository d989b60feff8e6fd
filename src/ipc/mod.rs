// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Local NDJSON IPC server (C6): accept loop, per-client framing, command
//! dispatch, and broadcast.

pub mod protocol;

use std::collections::HashMap;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use tokio::fs as tokio_fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixListener;
use tokio::sync::{Mutex, Notify};

use crate::error::SentinelError;
use crate::quarantine::QuarantineStore;
use protocol::{Command, Event};

/// Frames larger than this (including the terminating newline) are
/// discarded; the connection survives.
const MAX_FRAME_BYTES: usize = 4096;
const READ_CHUNK: usize = 1024;

type ClientId = u64;

/// The IPC server (C6): owns the client table and drives the accept loop.
pub struct IpcServer {
    clients: Mutex<HashMap<ClientId, OwnedWriteHalf>>,
    next_id: AtomicU64,
    max_clients: usize,
}

impl IpcServer {
    #[must_use]
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            max_clients,
        }
    }

    /// Bind the socket at `path`, set its mode to world-writable so a local
    /// unprivileged desktop UI can connect, and serve connections until
    /// `shutdown` is notified.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub async fn run(
        self: Arc<Self>,
        path: &Path,
        quarantine: Arc<QuarantineStore>,
        shutdown: Arc<Notify>,
    ) -> Result<(), SentinelError> {
        let _ = tokio_fs::remove_file(path).await;
        let listener = UnixListener::bind(path).map_err(|source| SentinelError::IpcBind {
            path: path.to_path_buf(),
            source,
        })?;
        if let Err(e) = tokio_fs::set_permissions(path, std::fs::Permissions::from_mode(0o666)).await {
            warn!("failed to set IPC socket permissions on {}: {e}", path.display());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => self.clone().handle_new_connection(stream, Arc::clone(&quarantine)).await,
                        Err(e) => warn!("IPC accept error: {e}"),
                    }
                }
                () = shutdown.notified() => {
                    debug!("IPC server shutting down");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_new_connection(self: Arc<Self>, stream: tokio::net::UnixStream, quarantine: Arc<QuarantineStore>) {
        let mut clients = self.clients.lock().await;
        if clients.len() >= self.max_clients {
            warn!("IPC client limit reached, rejecting new connection");
            drop(clients);
            drop(stream);
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (read_half, write_half) = stream.into_split();
        clients.insert(id, write_half);
        drop(clients);

        tokio::spawn(async move {
            self.clone().client_read_loop(id, read_half, quarantine).await;
            self.clients.lock().await.remove(&id);
        });
    }

    async fn client_read_loop(
        self: Arc<Self>,
        id: ClientId,
        mut reader: tokio::net::unix::OwnedReadHalf,
        quarantine: Arc<QuarantineStore>,
    ) {
        let mut accumulator: Vec<u8> = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            accumulator.extend_from_slice(&chunk[..n]);

            if accumulator.len() > MAX_FRAME_BYTES {
                warn!("client {id} exceeded frame limit, discarding partial frame");
                accumulator.clear();
                continue;
            }

            while let Some(newline_pos) = accumulator.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = accumulator.drain(..=newline_pos).collect();
                let line = &line[..line.len() - 1];
                self.handle_line(id, line, &quarantine).await;
            }
        }
    }

    async fn handle_line(&self, id: ClientId, line: &[u8], quarantine: &Arc<QuarantineStore>) {
        let text = String::from_utf8_lossy(line);
        let command: Command = match serde_json::from_str(&text) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!("client {id} sent malformed JSON: {e}");
                return;
            }
        };

        match command.action.as_str() {
            "sync_state" => self.dispatch_sync_state(id, quarantine).await,
            "restore" => self.dispatch_restore(command.id.as_deref(), quarantine).await,
            "delete" => self.dispatch_delete(command.id.as_deref(), quarantine).await,
            other => warn!("client {id} sent unrecognized action {other:?}"),
        }
    }

    async fn dispatch_sync_state(&self, id: ClientId, quarantine: &Arc<QuarantineStore>) {
        let entries = quarantine.list();
        for entry in &entries {
            self.send_to(id, &Event::sync_entry(entry)).await;
        }
        self.send_to(id, &Event::sync_complete(entries.len())).await;
    }

    async fn dispatch_restore(&self, id: Option<&str>, quarantine: &Arc<QuarantineStore>) {
        let Some(id) = id else {
            warn!("restore command missing required id");
            return;
        };
        match quarantine.restore(id) {
            Ok(entry) => self.broadcast(&Event::restore(&entry)).await,
            Err(e) => warn!("restore of {id} failed: {e}"),
        }
    }

    async fn dispatch_delete(&self, id: Option<&str>, quarantine: &Arc<QuarantineStore>) {
        let Some(id) = id else {
            warn!("delete command missing required id");
            return;
        };
        match quarantine.delete(id) {
            Ok(entry) => self.broadcast(&Event::delete(&entry)).await,
            Err(e) => warn!("delete of {id} failed: {e}"),
        }
    }

    /// Write `event` to every connected client; clients whose write fails
    /// (broken pipe, reset) are dropped from the table.
    pub async fn broadcast(&self, event: &Event) {
        let line = event.to_line();
        let mut clients = self.clients.lock().await;
        let mut dead = Vec::new();
        for (id, writer) in clients.iter_mut() {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                debug!("client {id} write failed, closing slot: {e}");
                dead.push(*id);
            }
        }
        for id in dead {
            clients.remove(&id);
        }
    }

    /// Write `event` to exactly one client, identified by `id`.
    pub async fn send_to(&self, id: ClientId, event: &Event) {
        let line = event.to_line();
        let mut clients = self.clients.lock().await;
        if let Some(writer) = clients.get_mut(&id) {
            if let Err(e) = writer.write_all(line.as_bytes()).await {
                debug!("client {id} write failed, closing slot: {e}");
                clients.remove(&id);
            }
        }
    }

    /// Current number of connected clients, for observability.
    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quarantine::QuarantineStore;
    use tokio::io::AsyncBufReadExt;
    use tokio::net::UnixStream;

    async fn spawn_server(dir: &tempfile::TempDir) -> (Arc<IpcServer>, std::path::PathBuf, Arc<Notify>) {
        let socket_path = dir.path().join("sentinel.sock");
        let server = Arc::new(IpcServer::new(8));
        let quarantine = Arc::new(QuarantineStore::init(dir.path().join("quarantine")).unwrap());
        let shutdown = Arc::new(Notify::new());

        let run_server = Arc::clone(&server);
        let run_path = socket_path.clone();
        let run_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            let _ = run_server.run(&run_path, quarantine, run_shutdown).await;
        });

        // Give the listener a moment to bind.
        for _ in 0..50 {
            if socket_path.exists() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        (server, socket_path, shutdown)
    }

    #[tokio::test]
    async fn sync_state_replies_only_to_requesting_client() {
        let dir = tempfile::tempdir().unwrap();
        let (_server, socket_path, _shutdown) = spawn_server(&dir).await;

        let mut client_a = UnixStream::connect(&socket_path).await.unwrap();
        let mut client_b = UnixStream::connect(&socket_path).await.unwrap();

        client_a.write_all(b"{\"action\":\"sync_state\"}\n").await.unwrap();

        let mut reader = tokio::io::BufReader::new(&mut client_a);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains("\"sync_complete\""));

        // client_b should see nothing; confirm by having it time out.
        let mut buf = [0u8; 16];
        let result = tokio::time::timeout(std::time::Duration::from_millis(100), client_b.read(&mut buf)).await;
        assert!(result.is_err(), "client_b should not receive sync_state traffic");
    }

    #[tokio::test]
    async fn malformed_json_does_not_close_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (server, socket_path, _shutdown) = spawn_server(&dir).await;

        let mut client = UnixStream::connect(&socket_path).await.unwrap();
        client.write_all(b"not json at all\n").await.unwrap();
        client.write_all(b"{\"action\":\"sync_state\"}\n").await.unwrap();

        let mut reader = tokio::io::BufReader::new(&mut client);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.contains("\"sync_complete\""));
        assert_eq!(server.client_count().await, 1);
    }
}
