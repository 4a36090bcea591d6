//! The audit collaborator: every committed mutation is handed to an [`AuditSink`].

use cellalloc_core::ChangeRecord;
use fs2::FileExt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit serialization error: {0}")]
    Serialization(String),
    #[error("audit sink unavailable: {0}")]
    Unavailable(String),
}

pub trait AuditSink {
    fn record_change(&self, record: ChangeRecord) -> Result<(), AuditError>;
}

impl<T: AuditSink + ?Sized> AuditSink for &T {
    fn record_change(&self, record: ChangeRecord) -> Result<(), AuditError> {
        (**self).record_change(record)
    }
}

impl<T: AuditSink + ?Sized> AuditSink for Arc<T> {
    fn record_change(&self, record: ChangeRecord) -> Result<(), AuditError> {
        (**self).record_change(record)
    }
}

impl<T: AuditSink + ?Sized> AuditSink for Box<T> {
    fn record_change(&self, record: ChangeRecord) -> Result<(), AuditError> {
        (**self).record_change(record)
    }
}

/// Hands a record to the sink; a failing sink is logged and otherwise ignored.
pub(crate) fn emit_change<A: AuditSink + ?Sized>(audit: &A, record: ChangeRecord) {
    let object_id = record.object_id.clone();
    let action = record.action;
    let content_type = record.content_type.as_str();
    if let Err(err) = audit.record_change(record) {
        warn!(
            event = "audit_failed",
            content_type,
            object_id = %object_id,
            action = %action,
            error = %err
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record_change(&self, _record: ChangeRecord) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    records: Mutex<Vec<ChangeRecord>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ChangeRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSink for RecordingAuditSink {
    fn record_change(&self, record: ChangeRecord) -> Result<(), AuditError> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
        Ok(())
    }
}

/// Appends one JSON document per line; an exclusive file lock guards each write.
#[derive(Debug, Clone)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<ChangeRecord>, AuditError> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| AuditError::Serialization(err.to_string()))
            })
            .collect()
    }
}

impl AuditSink for JsonlAuditSink {
    fn record_change(&self, record: ChangeRecord) -> Result<(), AuditError> {
        let line = serde_json::to_string(&record)
            .map_err(|err| AuditError::Serialization(err.to_string()))?;
        if let Some(parent) = self.path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.lock_exclusive()?;
        let written = writeln!(file, "{line}").and_then(|_| file.flush());
        FileExt::unlock(&file)?;
        written?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellalloc_core::{AuditAction, ContentType};
    use serde_json::json;

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingAuditSink::new();
        sink.record_change(ChangeRecord::new(ContentType::Sample, 1, AuditAction::Update))
            .expect("first");
        sink.record_change(ChangeRecord::new(ContentType::Allocation, 7, AuditAction::Delete))
            .expect("second");

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].object_id, "1");
        assert_eq!(records[1].action, AuditAction::Delete);
    }

    #[test]
    fn shared_sinks_forward_through_arc_and_refs() {
        let sink = Arc::new(RecordingAuditSink::new());
        let by_arc: &dyn AuditSink = &sink;
        by_arc
            .record_change(ChangeRecord::new(ContentType::StorageBox, "BOX1", AuditAction::Create))
            .expect("arc");
        (&*sink)
            .record_change(ChangeRecord::new(ContentType::StorageBox, "BOX2", AuditAction::Create))
            .expect("ref");
        assert_eq!(sink.len(), 2);
    }

    #[test]
    fn jsonl_sink_appends_lines_that_read_back() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("nested").join("audit.jsonl");
        let sink = JsonlAuditSink::new(&path);

        sink.record_change(
            ChangeRecord::new(ContentType::Sample, 20, AuditAction::Update)
                .old_values(json!({"cell_id": "B2"}))
                .batch(Some("batch-7")),
        )
        .expect("write first");
        sink.record_change(ChangeRecord::new(ContentType::Sample, 21, AuditAction::Update))
            .expect("write second");

        let records = JsonlAuditSink::read_all(&path).expect("read back");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].batch_id.as_deref(), Some("batch-7"));
        assert_eq!(records[0].old_values["cell_id"], "B2");
        assert!(JsonlAuditSink::read_all(dir.path().join("absent.jsonl"))
            .expect("missing file")
            .is_empty());
    }
}
