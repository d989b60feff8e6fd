// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! Antivirus streaming protocol client (C1).
//!
//! Speaks the `INSTREAM` wire protocol over a local stream socket: a literal
//! command, a stream of length-prefixed chunks read from a file the daemon
//! itself opens, a zero-length terminator, then a textual verdict. The
//! daemon never asks the engine to open a path by name, to avoid
//! permission-domain mismatches between daemon and engine.

use std::fs::File;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use log::debug;

use crate::error::TransportError;

const CHUNK_SIZE: usize = 8 * 1024;
const REPLY_CAP: usize = 4096;
const THREAT_NAME_CAP: usize = 255;

/// Verdict returned by a completed scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanReport {
    Clean,
    Infected(String),
    ScannerError,
}

/// Antivirus engine client.
pub trait VirusScanner: Send + Sync {
    /// Scan the file at `path`, opening it itself.
    ///
    /// # Errors
    /// Returns [`TransportError`] if the engine cannot be reached or its
    /// reply cannot be parsed at all.
    fn scan(&self, path: &Path) -> Result<ScanReport, TransportError>;

    /// Check whether the engine is reachable and responding.
    fn ping(&self) -> bool;
}

/// `ClamAV`-compatible streaming scanner client.
pub struct ClamAVScanner {
    socket_path: PathBuf,
}

impl ClamAVScanner {
    #[must_use]
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }

    fn connect(&self) -> Result<UnixStream, TransportError> {
        UnixStream::connect(&self.socket_path).map_err(|source| TransportError::Connect {
            path: self.socket_path.clone(),
            source,
        })
    }

    fn stream_file(&self, path: &Path) -> Result<String, TransportError> {
        let mut file = File::open(path)?;
        let mut stream = self.connect()?;
        stream.write_all(b"zINSTREAM\0")?;

        let mut buf = [0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            let len = u32::try_from(n).unwrap_or(u32::MAX);
            stream.write_all(&len.to_be_bytes())?;
            stream.write_all(&buf[..n])?;
        }
        stream.write_all(&[0, 0, 0, 0])?;

        let mut reply = Vec::new();
        let mut chunk = [0u8; 512];
        loop {
            let n = stream.read(&mut chunk)?;
            if n == 0 || reply.len() >= REPLY_CAP {
                break;
            }
            reply.extend_from_slice(&chunk[..n]);
        }
        Ok(String::from_utf8_lossy(&reply).trim().to_string())
    }

    /// Parse a textual reply into a [`ScanReport`].
    ///
    /// # Errors
    /// Returns [`TransportError::UnparseableReply`] if none of `OK`,
    /// `FOUND`, or `ERROR` appears in the reply.
    pub fn parse_reply(reply: &str) -> Result<ScanReport, TransportError> {
        if reply.ends_with(" OK") || reply == "OK" {
            return Ok(ScanReport::Clean);
        }
        if reply.contains(" FOUND") {
            let threat = reply
                .rsplit_once(": ")
                .map_or("unknown", |(_, rest)| rest.trim_end_matches(" FOUND"));
            let threat: String = threat.chars().take(THREAT_NAME_CAP).collect();
            return Ok(ScanReport::Infected(threat));
        }
        if reply.contains(" ERROR") {
            return Ok(ScanReport::ScannerError);
        }
        Err(TransportError::UnparseableReply(reply.to_string()))
    }
}

impl VirusScanner for ClamAVScanner {
    fn scan(&self, path: &Path) -> Result<ScanReport, TransportError> {
        let reply = self.stream_file(path)?;
        debug!("scanner reply for {}: {reply:?}", path.display());
        Self::parse_reply(&reply)
    }

    fn ping(&self) -> bool {
        let Ok(mut stream) = self.connect() else {
            return false;
        };
        if stream.write_all(b"zPING\0").is_err() {
            return false;
        }
        let mut buf = [0u8; 64];
        match stream.read(&mut buf) {
            Ok(n) => String::from_utf8_lossy(&buf[..n]).trim_matches('\0').trim() == "PONG",
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_reply() {
        let report = ClamAVScanner::parse_reply("stream: OK").unwrap();
        assert_eq!(report, ScanReport::Clean);
    }

    #[test]
    fn parses_infected_reply_with_threat_name() {
        let report =
            ClamAVScanner::parse_reply("stream: Win.Test.EICAR_HDB-1 FOUND").unwrap();
        assert_eq!(report, ScanReport::Infected("Win.Test.EICAR_HDB-1".to_string()));
    }

    #[test]
    fn parses_error_reply() {
        let report = ClamAVScanner::parse_reply("stream: ERROR").unwrap();
        assert_eq!(report, ScanReport::ScannerError);
    }

    #[test]
    fn unrecognized_reply_is_transport_error() {
        let result = ClamAVScanner::parse_reply("garbage");
        assert!(matches!(result, Err(TransportError::UnparseableReply(_))));
    }

    #[test]
    fn threat_name_is_truncated_to_255_bytes() {
        let long_name = "A".repeat(400);
        let reply = format!("stream: {long_name} FOUND");
        let report = ClamAVScanner::parse_reply(&reply).unwrap();
        match report {
            ScanReport::Infected(name) => assert_eq!(name.len(), 255),
            other => panic!("expected Infected, got {other:?}"),
        }
    }
}
