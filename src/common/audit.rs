//! Audit logging for administrative coordinator events.
//!
//! Each entry is one JSON line. Entries go to an optional file and to the
//! tracing log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Audit log event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    InstanceRegistered,
    SpaceAdded,
    SpaceDeleted,
    HostFailed,
    Quiesce,
    Shutdown,
    GoLive,
    StateRestored,
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    #[serde(with = "chrono::serde::ts_seconds")]
    pub timestamp: DateTime<Utc>,
    pub event: AuditEventType,
    /// Connection that asked for the change
    pub actor: String,
    pub target: Option<String>,
    /// Configuration version after the change
    pub version: u64,
}

pub struct AuditLogger {
    file: Option<Mutex<File>>,
}

impl AuditLogger {
    /// Append to `path`. Failing to open the file disables file output.
    pub fn open(path: &Path) -> Self {
        let file = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(f) => Some(Mutex::new(f)),
            Err(e) => {
                tracing::warn!("Audit log {} unavailable: {}", path.display(), e);
                None
            }
        };
        Self { file }
    }

    /// Logger that only emits through tracing.
    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn log(&self, entry: &AuditEntry) {
        let line = serde_json::to_string(entry).unwrap_or_else(|_| "{}".to_string());
        tracing::info!(target: "spacecoord::audit", "{}", line);
        if let Some(file) = &self.file {
            if let Ok(mut f) = file.lock() {
                let _ = writeln!(f, "{}", line);
            }
        }
    }

    pub fn log_event(
        &self,
        event: AuditEventType,
        actor: impl Into<String>,
        target: Option<String>,
        version: u64,
    ) {
        self.log(&AuditEntry {
            timestamp: Utc::now(),
            event,
            actor: actor.into(),
            target,
            version,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_audit_log_appends_json_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let logger = AuditLogger::open(&path);
        logger.log_event(AuditEventType::SpaceAdded, "control", Some("kv".into()), 3);
        logger.log_event(AuditEventType::Quiesce, "control", None, 4);

        let text = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<AuditEntry> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].event, AuditEventType::SpaceAdded);
        assert_eq!(entries[0].target.as_deref(), Some("kv"));
        assert_eq!(entries[1].version, 4);
    }
}
