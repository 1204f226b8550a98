//! Session bookkeeping: metadata and the operation log.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Identity and timestamps of a reconstruction session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    /// Document kind, always [`SESSION_KIND`](super::SESSION_KIND).
    pub kind: String,

    /// Schema version the document was written with.
    pub schema_version: u32,

    /// Unix timestamp when the session was created (seconds since epoch).
    pub created_at: u64,

    /// Unix timestamp of the last change (seconds since epoch).
    pub last_modified: u64,

    #[serde(default)]
    pub description: Option<String>,
}

impl SessionMetadata {
    pub fn new(kind: impl Into<String>, schema_version: u32) -> Self {
        let now = current_timestamp();
        Self {
            kind: kind.into(),
            schema_version,
            created_at: now,
            last_modified: now,
            description: None,
        }
    }

    /// Update the last_modified timestamp to now.
    pub fn touch(&mut self) {
        self.last_modified = current_timestamp();
    }
}

/// Lightweight operation log entry.
///
/// Audit trail of configure/run/checkpoint events; not used for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix timestamp of the operation (seconds since epoch).
    pub timestamp: u64,

    /// Operation name (e.g. "configure", "run", "checkpoint").
    pub operation: String,

    pub success: bool,

    /// Optional notes or error message.
    #[serde(default)]
    pub notes: Option<String>,
}

impl LogEntry {
    pub fn success_with_notes(operation: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            operation: operation.into(),
            success: true,
            notes: Some(notes.into()),
        }
    }

    pub fn failure(operation: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            timestamp: current_timestamp(),
            operation: operation.into(),
            success: false,
            notes: Some(error.into()),
        }
    }
}

/// Current Unix timestamp in seconds; 0 if the clock is before the epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_new() {
        let meta = SessionMetadata::new("reconstruction", 1);
        assert_eq!(meta.kind, "reconstruction");
        assert_eq!(meta.schema_version, 1);
        assert!(meta.created_at > 0);
        assert_eq!(meta.created_at, meta.last_modified);
        assert!(meta.description.is_none());
    }

    #[test]
    fn metadata_touch_never_goes_back() {
        let mut meta = SessionMetadata::new("reconstruction", 2);
        let original = meta.last_modified;
        meta.touch();
        assert!(meta.last_modified >= original);
        assert_eq!(meta.created_at, original);
    }

    #[test]
    fn log_entries() {
        let ok = LogEntry::success_with_notes("run", "completed after 50 iterations");
        assert!(ok.success);
        assert_eq!(ok.notes.as_deref(), Some("completed after 50 iterations"));

        let failed = LogEntry::failure("checkpoint", "disk full");
        assert_eq!(failed.operation, "checkpoint");
        assert!(!failed.success);
        assert!(failed.timestamp > 0);
    }
}
