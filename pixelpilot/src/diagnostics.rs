//! Structured failure records, each optionally paired with the screenshot taken
//! when the failure happened.

use crate::descriptor::ActionDescriptor;
use crate::detection::LocatorMethod;
use crate::errors::{FailureKind, LocateError};
use crate::screenshot::Screenshot;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, warn};
use uuid::Uuid;

const JOURNAL_FILE: &str = "diagnostics.jsonl";
const MEMORY_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiagnosticRecord {
    pub timestamp: DateTime<Utc>,
    pub method: Option<LocatorMethod>,
    pub error: String,
    pub failure_kind: FailureKind,
    pub action_descriptor: ActionDescriptor,
    pub screenshot_ref: Option<String>,
}

impl DiagnosticRecord {
    pub fn new(
        method: Option<LocatorMethod>,
        error: &LocateError,
        descriptor: &ActionDescriptor,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            method,
            error: error.to_string(),
            failure_kind: error.kind(),
            action_descriptor: descriptor.clone(),
            screenshot_ref: None,
        }
    }
}

/// Receives one record per failure. Returns the stored screenshot reference, if any.
pub trait DiagnosticsSink: Send + Sync {
    fn emit(&self, record: DiagnosticRecord, screenshot: Option<&Screenshot>) -> Option<String>;
}

fn log_record(record: &DiagnosticRecord) {
    warn!(
        method = record.method.map(|m| m.as_str()),
        kind = ?record.failure_kind,
        screenshot = record.screenshot_ref.as_deref(),
        "Locator failure: {}",
        record.error
    );
}

/// Writes screenshots as PNG files and appends records to `diagnostics.jsonl`.
pub struct FileDiagnosticsSink {
    dir: PathBuf,
    journal: Mutex<()>,
}

impl FileDiagnosticsSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            journal: Mutex::new(()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn save_screenshot(&self, screenshot: &Screenshot) -> std::io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.png", Uuid::new_v4()));
        screenshot
            .save_png(&path)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(path)
    }

    fn append(&self, record: &DiagnosticRecord) -> std::io::Result<()> {
        let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
        let _guard = self.journal.lock().unwrap_or_else(|p| p.into_inner());
        fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.journal_path())?;
        writeln!(file, "{line}")
    }
}

impl DiagnosticsSink for FileDiagnosticsSink {
    fn emit(&self, mut record: DiagnosticRecord, screenshot: Option<&Screenshot>) -> Option<String> {
        if let Some(shot) = screenshot {
            match self.save_screenshot(shot) {
                Ok(path) => record.screenshot_ref = Some(path.display().to_string()),
                Err(e) => error!("Failed to save diagnostic screenshot: {e}"),
            }
        }
        log_record(&record);
        if let Err(e) = self.append(&record) {
            error!(path = %self.journal_path().display(), "Failed to append diagnostic record: {e}");
        }
        record.screenshot_ref
    }
}

/// Keeps the most recent records and screenshots in memory.
#[derive(Default)]
pub struct MemoryDiagnosticsSink {
    entries: Mutex<VecDeque<(DiagnosticRecord, Option<Screenshot>)>>,
}

impl MemoryDiagnosticsSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DiagnosticRecord> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.iter().map(|(r, _)| r.clone()).collect()
    }

    /// Screenshot stored under a `memory://` reference.
    pub fn screenshot(&self, reference: &str) -> Option<Screenshot> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries
            .iter()
            .find(|(r, _)| r.screenshot_ref.as_deref() == Some(reference))
            .and_then(|(_, s)| s.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DiagnosticsSink for MemoryDiagnosticsSink {
    fn emit(&self, mut record: DiagnosticRecord, screenshot: Option<&Screenshot>) -> Option<String> {
        if screenshot.is_some() {
            record.screenshot_ref = Some(format!("memory://{}", Uuid::new_v4()));
        }
        log_record(&record);
        let reference = record.screenshot_ref.clone();
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        if entries.len() == MEMORY_CAPACITY {
            entries.pop_front();
        }
        entries.push_back((record, screenshot.cloned()));
        reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Point;
    use crate::tests::fakes::blank_screen;

    fn record() -> DiagnosticRecord {
        DiagnosticRecord::new(
            Some(LocatorMethod::Template),
            &LocateError::TemplateMissing("save".to_string()),
            &ActionDescriptor::for_template("save").with_fallback_point(Point::new(1, 2)),
        )
    }

    #[test]
    fn file_sink_writes_png_and_journal_line() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileDiagnosticsSink::new(dir.path().join("diag"));
        let reference = sink.emit(record(), Some(&blank_screen(8, 8))).unwrap();
        assert!(Path::new(&reference).exists());

        let journal = fs::read_to_string(sink.journal_path()).unwrap();
        let line: serde_json::Value = serde_json::from_str(journal.trim()).unwrap();
        assert_eq!(line["method"], "template");
        assert_eq!(line["failure_kind"], "template_missing");
        assert_eq!(line["screenshot_ref"], reference.as_str());
        assert_eq!(line["action_descriptor"]["template_id"], "save");
    }

    #[test]
    fn file_sink_without_screenshot_still_journals() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileDiagnosticsSink::new(dir.path());
        assert_eq!(sink.emit(record(), None), None);
        sink.emit(record(), None);
        let journal = fs::read_to_string(sink.journal_path()).unwrap();
        assert_eq!(journal.lines().count(), 2);
    }

    #[test]
    fn memory_sink_keeps_screenshots_addressable() {
        let sink = MemoryDiagnosticsSink::new();
        let reference = sink.emit(record(), Some(&blank_screen(4, 4))).unwrap();
        assert!(reference.starts_with("memory://"));
        assert_eq!(sink.screenshot(&reference).unwrap().width(), 4);
        assert_eq!(sink.records()[0].screenshot_ref.as_deref(), Some(reference.as_str()));
    }

    #[test]
    fn memory_sink_is_bounded() {
        let sink = MemoryDiagnosticsSink::new();
        for _ in 0..MEMORY_CAPACITY + 10 {
            sink.emit(record(), None);
        }
        assert_eq!(sink.len(), MEMORY_CAPACITY);
    }
}
