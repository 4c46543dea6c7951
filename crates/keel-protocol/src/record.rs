//! Persisted test result record
//!
//! One record is written per test action after it finishes. The record is
//! immutable once written; a rerun replaces the file wholesale.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Schema version for test.result.json
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const RECORD_SCHEMA_ID: &str = "keel/test_result@1";

/// Terminal status of a test action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Passed,
    Failed,
    Timeout,
    Incomplete,
}

impl TestStatus {
    pub fn is_passed(&self) -> bool {
        matches!(self, TestStatus::Passed)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestStatus::Passed => write!(f, "PASSED"),
            TestStatus::Failed => write!(f, "FAILED"),
            TestStatus::Timeout => write!(f, "TIMEOUT"),
            TestStatus::Incomplete => write!(f, "INCOMPLETE"),
        }
    }
}

/// A sub-test-case that did not pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedTestCase {
    /// Test case name
    pub name: String,
    /// Enclosing class or suite, when the report has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    /// Failure message, when the report has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Errors for record operations
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("unsupported schema {found} (expected {expected})")]
    SchemaMismatch { found: String, expected: &'static str },
}

/// Test result record (test.result.json)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultRecord {
    pub schema_version: u32,
    pub schema_id: String,

    /// Test target label
    pub target: String,

    /// Terminal status
    pub status: TestStatus,

    /// Whether the result may be reused by a later build
    pub cacheable: bool,

    /// Failed sub-test-cases, when the test wrote a structured report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_test_cases: Option<Vec<FailedTestCase>>,

    /// Exit code of the test process, if it exited normally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,

    /// Combined stdout/stderr log
    pub test_log: PathBuf,

    /// Structured report location (may not exist)
    pub xml_output: PathBuf,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl TestResultRecord {
    /// Create a record with no failed-case detail
    pub fn new(
        target: impl Into<String>,
        status: TestStatus,
        cacheable: bool,
        test_log: PathBuf,
        xml_output: PathBuf,
        started_at: DateTime<Utc>,
    ) -> Self {
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            schema_version: RECORD_SCHEMA_VERSION,
            schema_id: RECORD_SCHEMA_ID.to_string(),
            target: target.into(),
            status,
            cacheable,
            failed_test_cases: None,
            exit_code: None,
            test_log,
            xml_output,
            started_at,
            finished_at,
            duration_ms,
        }
    }

    pub fn with_exit_code(mut self, exit_code: Option<i32>) -> Self {
        self.exit_code = exit_code;
        self
    }

    pub fn with_failed_test_cases(mut self, cases: Option<Vec<FailedTestCase>>) -> Self {
        self.failed_test_cases = cases;
        self
    }

    pub fn passed(&self) -> bool {
        self.status.is_passed()
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON, rejecting records of another schema
    pub fn from_json(json: &str) -> Result<Self, RecordError> {
        let record: Self = serde_json::from_str(json)?;
        if record.schema_id != RECORD_SCHEMA_ID {
            return Err(RecordError::SchemaMismatch {
                found: record.schema_id,
                expected: RECORD_SCHEMA_ID,
            });
        }
        Ok(record)
    }

    /// Write atomically to file (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> Result<(), RecordError> {
        let json = self.to_json()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Load from file
    pub fn from_file(path: &Path) -> Result<Self, RecordError> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(status: TestStatus) -> TestResultRecord {
        TestResultRecord::new(
            "//pkg:foo_test",
            status,
            status.is_passed(),
            PathBuf::from("testlogs/pkg/foo_test/test.log"),
            PathBuf::from("testlogs/pkg/foo_test/test.xml"),
            Utc::now(),
        )
    }

    #[test]
    fn test_status_serializes_screaming() {
        let json = sample(TestStatus::Timeout).to_json().unwrap();
        assert!(json.contains("\"status\": \"TIMEOUT\""));
        assert!(json.contains("\"schema_id\": \"keel/test_result@1\""));
        assert!(!json.contains("failed_test_cases"));
    }

    #[test]
    fn test_failed_cases_are_kept() {
        let record = sample(TestStatus::Failed).with_failed_test_cases(Some(vec![FailedTestCase {
            name: "testAdd".to_string(),
            class_name: Some("MathTest".to_string()),
            message: Some("expected 2".to_string()),
        }]));
        let parsed = TestResultRecord::from_json(&record.to_json().unwrap()).unwrap();
        assert_eq!(parsed.status, TestStatus::Failed);
        assert!(!parsed.cacheable);
        assert_eq!(parsed.failed_test_cases.unwrap()[0].name, "testAdd");
    }

    #[test]
    fn test_schema_mismatch_rejected() {
        let mut record = sample(TestStatus::Passed);
        record.schema_id = "other/thing@1".to_string();
        let json = serde_json::to_string(&record).unwrap();
        assert!(matches!(
            TestResultRecord::from_json(&json),
            Err(RecordError::SchemaMismatch { .. })
        ));
    }

    #[test]
    fn test_write_and_read_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("test.result.json");
        let record = sample(TestStatus::Passed).with_exit_code(Some(0));

        record.write_to_file(&path).unwrap();

        let loaded = TestResultRecord::from_file(&path).unwrap();
        assert_eq!(loaded, record);
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_display() {
        assert_eq!(TestStatus::Incomplete.to_string(), "INCOMPLETE");
        assert_eq!(TestStatus::Passed.to_string(), "PASSED");
    }
}
