//! Format-stable records produced by keel test execution.
//!
//! Two pieces live here because other tools read them:
//! - the persisted test result record (`test.result.json`)
//! - the reader for the structured per-test-case report a test writes to
//!   `XML_OUTPUT_FILE` (JUnit style)

pub mod record;
pub mod report;

pub use record::{
    FailedTestCase, RecordError, TestResultRecord, TestStatus, RECORD_SCHEMA_ID,
    RECORD_SCHEMA_VERSION,
};
pub use report::{
    parse_report, parse_report_file, CaseOutcome, HierarchicalTestResult, ReportError, TestCase,
};
