// SPDX-FileCopyrightText: 2025-2026 TII (SSRC) and the Ghaf contributors
// SPDX-License-Identifier: Apache-2.0

//! NDJSON message schemas exchanged over the IPC socket.

use chrono::Local;
use serde::{Deserialize, Serialize};

use crate::quarantine::QuarantineEntry;

/// A command sent by a connected client.
#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    pub action: String,
    #[serde(default)]
    pub id: Option<String>,
}

/// An event broadcast by the daemon, either to one client or to all of them.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threat: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    pub timestamp: String,
}

impl Event {
    fn now() -> String {
        Local::now().format("%Y-%m-%dT%H:%M:%S").to_string()
    }

    pub fn scan_clean(filename: &str) -> Self {
        Self::bare("scan_clean").with_filename(filename)
    }

    pub fn scan_threat(filename: &str, threat: &str) -> Self {
        Self::bare("scan_threat")
            .with_filename(filename)
            .with_threat(threat)
            .with_details("quarantined")
    }

    pub fn status(details: &str) -> Self {
        Self::bare("status").with_details(details)
    }

    pub fn restore(entry: &QuarantineEntry) -> Self {
        Self::bare("restore")
            .with_filename(entry.original_path.to_string_lossy())
            .with_id(&entry.id)
    }

    pub fn delete(entry: &QuarantineEntry) -> Self {
        Self::bare("delete")
            .with_filename(entry.original_path.to_string_lossy())
            .with_id(&entry.id)
    }

    pub fn sync_entry(entry: &QuarantineEntry) -> Self {
        Self::bare("sync_entry")
            .with_filename(entry.original_path.to_string_lossy())
            .with_threat(&entry.threat_name)
            .with_id(&entry.id)
    }

    pub fn sync_complete(count: usize) -> Self {
        let mut event = Self::bare("sync_complete");
        event.count = Some(count);
        event
    }

    fn bare(kind: &'static str) -> Self {
        Self {
            event: kind,
            filename: None,
            threat: None,
            details: None,
            id: None,
            count: None,
            timestamp: Self::now(),
        }
    }

    fn with_filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    fn with_threat(mut self, threat: impl Into<String>) -> Self {
        self.threat = Some(threat.into());
        self
    }

    fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Serialize to a single NDJSON line, including the trailing newline.
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_parses_required_action_only() {
        let cmd: Command = serde_json::from_str(r#"{"action":"sync_state"}"#).unwrap();
        assert_eq!(cmd.action, "sync_state");
        assert_eq!(cmd.id, None);
    }

    #[test]
    fn event_line_ends_with_newline_and_omits_absent_fields() {
        let line = Event::scan_clean("/tmp/w/a.txt").to_line();
        assert!(line.ends_with('\n'));
        assert!(line.contains("\"event\":\"scan_clean\""));
        assert!(!line.contains("\"threat\""));
    }

    #[test]
    fn sync_complete_carries_the_true_count() {
        let event = Event::sync_complete(2);
        assert_eq!(event.count, Some(2));
    }
}
