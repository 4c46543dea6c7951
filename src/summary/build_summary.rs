//! Build summary (build_summary.json)

use std::fs;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use keel_protocol::{FailedTestCase, TestResultRecord, TestStatus};
use serde::{Deserialize, Serialize};

use super::failure::{ExitCode, ExitCodeAggregator, FailureKind};
use crate::graph::EvalError;

pub const BUILD_SUMMARY_SCHEMA_VERSION: u32 = 1;
pub const BUILD_SUMMARY_SCHEMA_ID: &str = "keel/build_summary@1";

/// One test target in the summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestLine {
    pub target: String,
    pub status: TestStatus,
    pub cached: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_test_cases: Vec<FailedTestCase>,
}

/// A failure that is not a test result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSummary {
    pub schema_version: u32,
    pub schema_id: String,
    pub build_id: String,
    pub created_at: DateTime<Utc>,
    pub exit_code: i32,
    pub tests: Vec<TestLine>,
    pub failures: Vec<BuildFailure>,
    pub tests_passed: usize,
    pub tests_failed: usize,
    pub duration_ms: u64,
}

/// Collects results while a build runs
#[derive(Debug, Default)]
pub struct SummaryBuilder {
    tests: Vec<TestLine>,
    failures: Vec<BuildFailure>,
    exit: ExitCodeAggregator,
}

impl SummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_test(&mut self, record: &TestResultRecord, cached: bool) {
        if !record.passed() {
            self.exit.add(ExitCode::TestsFailed);
        }
        self.tests.push(TestLine {
            target: record.target.clone(),
            status: record.status,
            cached,
            failed_test_cases: record.failed_test_cases.clone().unwrap_or_default(),
        });
    }

    pub fn add_failure(&mut self, err: &EvalError) {
        let kind = FailureKind::of(err);
        self.exit.add(kind.exit_code());
        let failure = BuildFailure {
            kind,
            message: err.root_cause().to_string(),
        };
        if !self.failures.contains(&failure) {
            self.failures.push(failure);
        }
    }

    pub fn add_exit_code(&mut self, code: ExitCode) {
        self.exit.add(code);
    }

    pub fn exit_code(&self) -> ExitCode {
        self.exit.exit_code()
    }

    pub fn finish(mut self, build_id: impl Into<String>, started_at: DateTime<Utc>) -> BuildSummary {
        self.tests.sort_by(|a, b| a.target.cmp(&b.target));
        let created_at = Utc::now();
        let tests_passed = self.tests.iter().filter(|t| t.status.is_passed()).count();
        BuildSummary {
            schema_version: BUILD_SUMMARY_SCHEMA_VERSION,
            schema_id: BUILD_SUMMARY_SCHEMA_ID.to_string(),
            build_id: build_id.into(),
            created_at,
            exit_code: self.exit.exit_code().as_i32(),
            tests_passed,
            tests_failed: self.tests.len() - tests_passed,
            tests: self.tests,
            failures: self.failures,
            duration_ms: (created_at - started_at).num_milliseconds().max(0) as u64,
        }
    }
}

impl BuildSummary {
    /// Human-readable lines: one per test, failed cases indented below
    pub fn render(&self) -> String {
        let mut out = String::new();
        for failure in &self.failures {
            out.push_str(&format!("ERROR: {}\n", failure.message));
        }
        for test in &self.tests {
            let cached = if test.cached { " (cached)" } else { "" };
            out.push_str(&format!("{:<40} {}{}\n", test.target, test.status, cached));
            for case in &test.failed_test_cases {
                match &case.message {
                    Some(message) => out.push_str(&format!("    {}: {}\n", case.name, message)),
                    None => out.push_str(&format!("    {}\n", case.name)),
                }
            }
        }
        out.push_str(&format!(
            "Executed {} tests: {} passed, {} did not pass\n",
            self.tests.len(),
            self.tests_passed,
            self.tests_failed
        ));
        out
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write atomically (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {e}")))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::InvalidConfiguration;
    use std::path::PathBuf;

    fn record(target: &str, status: TestStatus) -> TestResultRecord {
        TestResultRecord::new(
            target,
            status,
            status.is_passed(),
            PathBuf::from("test.log"),
            PathBuf::from("test.xml"),
            Utc::now(),
        )
    }

    #[test]
    fn test_failed_tests_set_exit_code() {
        let mut builder = SummaryBuilder::new();
        builder.add_test(&record("//b:t", TestStatus::Passed), false);
        builder.add_test(
            &record("//a:t", TestStatus::Failed).with_failed_test_cases(Some(vec![
                FailedTestCase {
                    name: "testSub".to_string(),
                    class_name: None,
                    message: Some("expected 1".to_string()),
                },
            ])),
            false,
        );

        let summary = builder.finish("b1", Utc::now());

        assert_eq!(summary.exit_code, 3);
        assert_eq!(summary.tests_failed, 1);
        assert_eq!(summary.tests[0].target, "//a:t");
        let rendered = summary.render();
        assert!(rendered.contains("testSub: expected 1"));
        assert!(rendered.contains("Executed 2 tests: 1 passed, 1 did not pass"));
    }

    #[test]
    fn test_configuration_failure_outranks_tests() {
        let mut builder = SummaryBuilder::new();
        builder.add_test(&record("//a:t", TestStatus::Failed), false);
        let err = EvalError::from(InvalidConfiguration::FdoNotInputFile);
        builder.add_failure(&err);
        builder.add_failure(&err);

        let summary = builder.finish("b1", Utc::now());

        assert_eq!(summary.exit_code, 1);
        assert_eq!(summary.failures.len(), 1);
        assert!(summary.render().starts_with(
            "ERROR: invalid configuration: --fdo_optimize cannot accept targets that do not refer to input files"
        ));
    }

    #[test]
    fn test_write_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("out/build_summary.json");
        let summary = SummaryBuilder::new().finish("b1", Utc::now());

        summary.write_to_file(&path).unwrap();

        let loaded: BuildSummary =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.schema_id, BUILD_SUMMARY_SCHEMA_ID);
        assert_eq!(loaded.exit_code, 0);
    }
}
