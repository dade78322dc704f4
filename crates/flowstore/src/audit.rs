//! Audit trail for flowstore
//!
//! Structured records of security- and durability-relevant events: integrity
//! violations, rollbacks, repairs, migrations. Forwarding records to a
//! monitoring service is the embedder's job; this module produces them.
//!
//! Sinks:
//! - `JsonlAuditLog`: JSON lines on disk, rotated at 5MB (5 files kept),
//!   with an in-memory ring buffer fallback when the file cannot be written
//! - `MemoryAuditSink`: bounded in-memory buffer
//! - `TracingAuditSink`: forwards records to `tracing` only
//!
//! Records never carry stored payloads or full MAC tags.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::security::{create_secure_dir, set_secure_permissions, FILE_PERMISSIONS};

/// Maximum size for a single log file (5MB)
const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Number of rotated log files to keep
const MAX_LOG_FILES: usize = 5;

/// Maximum entries in the fallback ring buffer
const RING_BUFFER_SIZE: usize = 100;

/// Hex characters of a MAC tag that may appear in a record
pub const TAG_PREFIX_LEN: usize = 8;

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    /// Security-relevant failure
    Critical,
}

impl std::fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Audit event types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    // Integrity events
    IntegrityViolation,
    IntegrityMigrated,

    // Write path events
    VerificationFailed,
    WriteRolledBack,
    RollbackFailed,
    BackupsPurged,

    // Load path events
    CorruptionRepaired,

    // Startup
    MigrationApplied,

    // Custom event type for extensibility
    Custom(String),
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IntegrityViolation => write!(f, "integrity_violation"),
            Self::IntegrityMigrated => write!(f, "integrity_migrated"),
            Self::VerificationFailed => write!(f, "verification_failed"),
            Self::WriteRolledBack => write!(f, "write_rolled_back"),
            Self::RollbackFailed => write!(f, "rollback_failed"),
            Self::BackupsPurged => write!(f, "backups_purged"),
            Self::CorruptionRepaired => write!(f, "corruption_repaired"),
            Self::MigrationApplied => write!(f, "migration_applied"),
            Self::Custom(s) => write!(f, "custom:{}", s),
        }
    }
}

/// Audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// ISO 8601 timestamp
    pub timestamp: DateTime<Utc>,

    pub event: AuditEventType,

    pub severity: AuditSeverity,

    /// Human-readable message (no payloads)
    pub message: String,

    /// Additional context (no payloads)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(event: AuditEventType, severity: AuditSeverity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            severity,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}

/// Tag verification failure on read, as handed to the incident sink
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityIncident {
    pub timestamp: DateTime<Utc>,
    pub store_name: String,
    pub key: String,
    pub error_kind: String,
    /// First hex characters of the tag recomputed over the stored data
    pub expected_prefix: String,
    /// First hex characters of the tag found in storage
    pub actual_prefix: String,
}

impl SecurityIncident {
    pub fn integrity_violation(store_name: &str, key: &str, expected: &str, actual: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            store_name: store_name.to_string(),
            key: key.to_string(),
            error_kind: "integrity_violation".to_string(),
            expected_prefix: tag_prefix(expected),
            actual_prefix: tag_prefix(actual),
        }
    }
}

impl From<SecurityIncident> for AuditEntry {
    fn from(incident: SecurityIncident) -> Self {
        let message = format!(
            "Integrity verification failed for '{}' in store '{}'",
            incident.key, incident.store_name
        );
        let context = serde_json::json!({
            "storeName": incident.store_name,
            "key": incident.key,
            "errorKind": incident.error_kind,
            "expectedPrefix": incident.expected_prefix,
            "actualPrefix": incident.actual_prefix,
        });
        Self {
            timestamp: incident.timestamp,
            event: AuditEventType::IntegrityViolation,
            severity: AuditSeverity::Critical,
            message,
            context: Some(context),
        }
    }
}

fn tag_prefix(tag: &str) -> String {
    tag.chars().take(TAG_PREFIX_LEN).collect()
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: AuditEntry);
}

/// Forwards records to `tracing` without persisting them
#[derive(Debug, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        trace_entry(&entry);
    }
}

fn trace_entry(entry: &AuditEntry) {
    match entry.severity {
        AuditSeverity::Info => {
            tracing::info!(target: "flowstore::audit", event = %entry.event, "{}", entry.message);
        }
        AuditSeverity::Warning => {
            tracing::warn!(target: "flowstore::audit", event = %entry.event, "{}", entry.message);
        }
        AuditSeverity::Error | AuditSeverity::Critical => {
            tracing::error!(target: "flowstore::audit", event = %entry.event, "{}", entry.message);
        }
    }
}

/// Bounded in-memory sink; oldest entries are dropped at capacity
pub struct MemoryAuditSink {
    entries: Mutex<VecDeque<AuditEntry>>,
    capacity: usize,
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::with_capacity(RING_BUFFER_SIZE)
    }
}

impl MemoryAuditSink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of buffered entries of the given event type
    pub fn count(&self, event: &AuditEventType) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| &e.event == event)
            .count()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        trace_entry(&entry);
        let mut entries = self.entries.lock();
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// Audit logging errors
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    IO(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// JSON-lines audit log with size-based rotation
pub struct JsonlAuditLog {
    path: PathBuf,
    write_lock: Mutex<()>,
    /// Entries that could not be written yet
    fallback: MemoryAuditSink,
}

impl JsonlAuditLog {
    /// Open (or create) the log at `path`; the parent directory is created 0o700
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AuditError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                create_secure_dir(parent).map_err(|e| AuditError::IO(e.to_string()))?;
            }
        }

        Ok(Self {
            path,
            write_lock: Mutex::new(()),
            fallback: MemoryAuditSink::with_capacity(RING_BUFFER_SIZE),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    fn rotate_if_needed(&self) -> Result<(), AuditError> {
        if !self.path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.path).map_err(|e| AuditError::IO(e.to_string()))?;
        if metadata.len() < MAX_LOG_SIZE {
            return Ok(());
        }

        let oldest = self.rotated_path(MAX_LOG_FILES);
        if oldest.exists() {
            let _ = fs::remove_file(&oldest);
        }

        for i in (0..MAX_LOG_FILES).rev() {
            let from = if i == 0 {
                self.path.clone()
            } else {
                self.rotated_path(i)
            };
            if from.exists() {
                let _ = fs::rename(&from, self.rotated_path(i + 1));
            }
        }

        Ok(())
    }

    /// Append one entry, rotating first if the file is full
    pub fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock();
        self.write_locked(entry)
    }

    fn write_locked(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.rotate_if_needed()?;

        let is_new = !self.path.exists();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::IO(e.to_string()))?;

        if is_new {
            let _ = set_secure_permissions(&self.path, FILE_PERMISSIONS);
        }

        let mut writer = BufWriter::new(file);
        let line =
            serde_json::to_string(entry).map_err(|e| AuditError::Serialization(e.to_string()))?;
        writeln!(writer, "{}", line).map_err(|e| AuditError::IO(e.to_string()))?;
        writer.flush().map_err(|e| AuditError::IO(e.to_string()))?;
        Ok(())
    }

    /// Retry writing buffered entries; returns how many were flushed
    pub fn flush_buffered(&self) -> usize {
        let _guard = self.write_lock.lock();
        let pending = {
            let mut entries = self.fallback.entries.lock();
            entries.drain(..).collect::<Vec<_>>()
        };

        let mut flushed = 0;
        for entry in pending {
            if self.write_locked(&entry).is_ok() {
                flushed += 1;
            } else {
                self.fallback.entries.lock().push_back(entry);
            }
        }
        flushed
    }

    /// Entries waiting in the fallback buffer
    pub fn buffered_count(&self) -> usize {
        self.fallback.entries.lock().len()
    }
}

impl AuditSink for JsonlAuditLog {
    fn record(&self, entry: AuditEntry) {
        trace_entry(&entry);
        if self.buffered_count() > 0 {
            self.flush_buffered();
        }
        if let Err(e) = self.write(&entry) {
            tracing::error!("Audit log write failed, buffering entry: {}", e);
            self.fallback.record(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_incident_entry_omits_full_tag() -> Result<(), serde_json::Error> {
        let expected = "a".repeat(64);
        let actual = "b".repeat(64);
        let incident = SecurityIncident::integrity_violation("local", "workflows", &expected, &actual);
        assert_eq!(incident.expected_prefix, "aaaaaaaa");

        let entry = AuditEntry::from(incident);
        assert_eq!(entry.event, AuditEventType::IntegrityViolation);
        assert_eq!(entry.severity, AuditSeverity::Critical);

        let json = serde_json::to_string(&entry)?;
        assert!(json.contains("integrity_violation"));
        assert!(json.contains("workflows"));
        assert!(!json.contains(&expected));
        assert!(!json.contains(&actual));
        Ok(())
    }

    #[test]
    fn test_memory_sink_capacity() {
        let sink = MemoryAuditSink::with_capacity(3);
        for i in 0..5 {
            sink.record(AuditEntry::new(
                AuditEventType::Custom(format!("test_{}", i)),
                AuditSeverity::Info,
                format!("entry {}", i),
            ));
        }
        let entries = sink.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 2");
    }

    #[test]
    fn test_memory_sink_count_by_event() {
        let sink = MemoryAuditSink::default();
        sink.record(AuditEntry::new(
            AuditEventType::WriteRolledBack,
            AuditSeverity::Warning,
            "rolled back",
        ));
        sink.record(AuditEntry::new(
            AuditEventType::MigrationApplied,
            AuditSeverity::Info,
            "migrated",
        ));
        assert_eq!(sink.count(&AuditEventType::WriteRolledBack), 1);
        assert_eq!(sink.count(&AuditEventType::IntegrityViolation), 0);
    }

    #[test]
    fn test_jsonl_log_appends_lines() -> Result<(), Box<dyn std::error::Error>> {
        let dir = TempDir::new()?;
        let log = JsonlAuditLog::open(dir.path().join("audit").join("audit.log"))?;

        log.record(AuditEntry::new(
            AuditEventType::CorruptionRepaired,
            AuditSeverity::Warning,
            "repaired workflows",
        ));
        log.record(
            AuditEntry::new(
                AuditEventType::MigrationApplied,
                AuditSeverity::Info,
                "applied 1",
            )
            .with_context(serde_json::json!({"version": "1"})),
        );

        let content = fs::read_to_string(log.path())?;
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AuditEntry = serde_json::from_str(lines[1])?;
        assert_eq!(second.event, AuditEventType::MigrationApplied);
        assert_eq!(log.buffered_count(), 0);
        Ok(())
    }

    #[test]
    fn test_severity_display() {
        assert_eq!(AuditSeverity::Info.to_string(), "info");
        assert_eq!(AuditSeverity::Critical.to_string(), "critical");
        assert_eq!(
            AuditEventType::Custom("probe".into()).to_string(),
            "custom:probe"
        );
    }
}
