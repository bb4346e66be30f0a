//! Audit trail for the model vault
//!
//! Persistence and migration events are appended as JSON lines under the
//! vault's audit directory. Writes rotate at a size cap and never block or
//! fail a vault operation: a broken audit log degrades to a tracing warning.

use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::{self, FILE_PERMISSIONS};

/// Maximum size for a single log file (5MB)
const MAX_LOG_SIZE: u64 = 5 * 1024 * 1024;

/// Number of rotated log files to keep
const MAX_LOG_FILES: usize = 5;

/// Audit log file name
const AUDIT_LOG_NAME: &str = "vault_audit.log";

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Event severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuditSeverity::Info => "info",
            AuditSeverity::Warning => "warning",
            AuditSeverity::Error => "error",
            AuditSeverity::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

/// Vault events worth a durable record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    ModelSaved,
    ModelLoaded,
    ModelDeleted,
    BackupCreated,
    BackupRestored,
    BackupEvicted,
    IdentityRenamed,
    MigrationStarted,
    MigrationCompleted,
    MigrationFailed,
    MigrationRolledBack,
    MigrationEscalated,
    IntegrityFailure,
    RepairApplied,
    Custom(String),
}

impl std::fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AuditEvent::ModelSaved => "model_saved",
            AuditEvent::ModelLoaded => "model_loaded",
            AuditEvent::ModelDeleted => "model_deleted",
            AuditEvent::BackupCreated => "backup_created",
            AuditEvent::BackupRestored => "backup_restored",
            AuditEvent::BackupEvicted => "backup_evicted",
            AuditEvent::IdentityRenamed => "identity_renamed",
            AuditEvent::MigrationStarted => "migration_started",
            AuditEvent::MigrationCompleted => "migration_completed",
            AuditEvent::MigrationFailed => "migration_failed",
            AuditEvent::MigrationRolledBack => "migration_rolled_back",
            AuditEvent::MigrationEscalated => "migration_escalated",
            AuditEvent::IntegrityFailure => "integrity_failure",
            AuditEvent::RepairApplied => "repair_applied",
            AuditEvent::Custom(name) => return write!(f, "custom:{}", name),
        };
        write!(f, "{}", name)
    }
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub event: AuditEvent,
    pub severity: AuditSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl AuditEntry {
    pub fn new(event: AuditEvent, severity: AuditSeverity, message: impl Into<String>) -> Self {
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

/// Append-only JSONL audit log for one vault instance
pub struct AuditLog {
    log_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(log_dir: PathBuf) -> Self {
        Self {
            log_dir,
            write_lock: Mutex::new(()),
        }
    }

    fn log_path(&self) -> PathBuf {
        self.log_dir.join(AUDIT_LOG_NAME)
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.log_dir.join(format!("{}.{}", AUDIT_LOG_NAME, index))
    }

    /// Record an entry. Failures degrade to a tracing warning so vault
    /// operations are never blocked by the audit trail.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(e) = self.write(&entry) {
            tracing::warn!(event = %entry.event, "audit write failed: {}", e);
        }
    }

    pub fn record_event(
        &self,
        event: AuditEvent,
        severity: AuditSeverity,
        message: impl Into<String>,
    ) {
        self.record(AuditEntry::new(event, severity, message));
    }

    fn write(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let _guard = self.write_lock.lock();

        fs::create_dir_all(&self.log_dir).map_err(|e| AuditError::Io(e.to_string()))?;
        self.rotate_if_needed()?;

        let path = self.log_path();
        let is_new = !path.exists();

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| AuditError::Io(e.to_string()))?;
        let mut writer = BufWriter::new(file);

        let line =
            serde_json::to_string(entry).map_err(|e| AuditError::Serialization(e.to_string()))?;
        writeln!(writer, "{}", line).map_err(|e| AuditError::Io(e.to_string()))?;
        writer.flush().map_err(|e| AuditError::Io(e.to_string()))?;

        if is_new {
            layout::set_secure_permissions(&path, FILE_PERMISSIONS)
                .map_err(|e| AuditError::Io(e.to_string()))?;
        }
        Ok(())
    }

    fn rotate_if_needed(&self) -> Result<(), AuditError> {
        let path = self.log_path();
        let size = match fs::metadata(&path) {
            Ok(metadata) => metadata.len(),
            Err(_) => return Ok(()),
        };
        if size < MAX_LOG_SIZE {
            return Ok(());
        }

        // shift older files up, dropping the oldest
        for index in (0..MAX_LOG_FILES - 1).rev() {
            let from = if index == 0 {
                path.clone()
            } else {
                self.rotated_path(index)
            };
            if from.exists() {
                let to = self.rotated_path(index + 1);
                fs::rename(&from, &to).map_err(|e| AuditError::Io(e.to_string()))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_entry_serialization_shape() {
        let entry = AuditEntry::new(
            AuditEvent::ModelSaved,
            AuditSeverity::Info,
            "model saved for alice",
        )
        .with_context(serde_json::json!({"userId": "alice"}));

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("model_saved"));
        assert!(json.contains("info"));
        assert!(json.contains("alice"));
    }

    #[test]
    fn test_context_omitted_when_absent() {
        let entry = AuditEntry::new(
            AuditEvent::BackupCreated,
            AuditSeverity::Info,
            "backup created",
        );
        let json = serde_json::to_string(&entry).unwrap();
        assert!(!json.contains("context"));
    }

    #[test]
    fn test_custom_event_display() {
        let event = AuditEvent::Custom("maintenance".to_string());
        assert_eq!(event.to_string(), "custom:maintenance");
    }

    #[test]
    fn test_record_appends_json_lines() {
        let temp = TempDir::new().unwrap();
        let log = AuditLog::new(temp.path().to_path_buf());

        log.record_event(AuditEvent::ModelSaved, AuditSeverity::Info, "first");
        log.record_event(AuditEvent::ModelDeleted, AuditSeverity::Warning, "second");

        let contents = fs::read_to_string(temp.path().join(AUDIT_LOG_NAME)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let entry: AuditEntry = serde_json::from_str(line).unwrap();
            assert!(!entry.message.is_empty());
        }
    }

    #[test]
    fn test_rotated_path_naming() {
        let log = AuditLog::new(PathBuf::from("/tmp/audit"));
        assert_eq!(
            log.rotated_path(1),
            PathBuf::from(format!("/tmp/audit/{}.1", AUDIT_LOG_NAME))
        );
    }

    #[test]
    fn test_record_never_panics_on_bad_dir() {
        // a file where the directory should be
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("blocked");
        fs::write(&blocker, b"file").unwrap();

        let log = AuditLog::new(blocker);
        log.record_event(AuditEvent::ModelSaved, AuditSeverity::Info, "ignored");
    }
}
