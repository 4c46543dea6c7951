//! Reader for the structured per-test-case report (JUnit style XML).
//!
//! Only the parts the result record needs are extracted: suite name, case
//! name, class name, outcome and failure message. Anything else in the
//! document is ignored.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use regex_lite::Regex;

use crate::record::FailedTestCase;

/// Errors while reading a report
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("report is not XML")]
    NotXml,

    #[error("unterminated <testcase> element")]
    Unterminated,
}

/// Outcome of a single test case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseOutcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

/// A single test case from the report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub name: String,
    pub class_name: Option<String>,
    pub outcome: CaseOutcome,
    pub message: Option<String>,
}

/// Parsed report: suite name plus the flattened list of test cases
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HierarchicalTestResult {
    pub suite: Option<String>,
    pub cases: Vec<TestCase>,
}

impl HierarchicalTestResult {
    /// Failed and errored cases, or `None` when every case passed or was skipped
    pub fn collect_failed_test_cases(&self) -> Option<Vec<FailedTestCase>> {
        let failed: Vec<FailedTestCase> = self
            .cases
            .iter()
            .filter(|c| matches!(c.outcome, CaseOutcome::Failed | CaseOutcome::Error))
            .map(|c| FailedTestCase {
                name: c.name.clone(),
                class_name: c.class_name.clone(),
                message: c.message.clone(),
            })
            .collect();

        if failed.is_empty() {
            None
        } else {
            Some(failed)
        }
    }

    pub fn total(&self) -> usize {
        self.cases.len()
    }
}

fn testcase_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)<testcase\b([^>]*?)(?:/>|>(.*?)</testcase>)").expect("static regex")
    })
}

fn attr_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"([A-Za-z_:][\w:.-]*)\s*=\s*"([^"]*)""#).expect("static regex"))
}

fn suite_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<testsuite\b([^>]*)>").expect("static regex"))
}

fn outcome_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<(failure|error|skipped)\b([^>]*?)/?>").expect("static regex"))
}

fn attribute(attrs: &str, name: &str) -> Option<String> {
    attr_re()
        .captures_iter(attrs)
        .find(|c| &c[1] == name)
        .map(|c| unescape(&c[2]))
}

fn unescape(raw: &str) -> String {
    raw.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Parse report text into structured per-case results
pub fn parse_report(xml: &str) -> Result<HierarchicalTestResult, ReportError> {
    if !xml.trim_start().starts_with('<') {
        return Err(ReportError::NotXml);
    }

    let suite = suite_re()
        .captures(xml)
        .and_then(|c| attribute(&c[1], "name"));

    let mut cases = Vec::new();
    let mut consumed = 0;
    for caps in testcase_re().captures_iter(xml) {
        let attrs = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let name = attribute(attrs, "name").unwrap_or_default();
        let class_name = attribute(attrs, "classname");

        let (outcome, message) = match caps.get(2).and_then(|body| outcome_re().captures(body.as_str())) {
            Some(inner) => {
                let outcome = match &inner[1] {
                    "failure" => CaseOutcome::Failed,
                    "error" => CaseOutcome::Error,
                    _ => CaseOutcome::Skipped,
                };
                (outcome, attribute(&inner[2], "message"))
            }
            None => (CaseOutcome::Passed, None),
        };

        consumed += 1;
        cases.push(TestCase {
            name,
            class_name,
            outcome,
            message,
        });
    }

    if xml.matches("<testcase").count() != consumed {
        return Err(ReportError::Unterminated);
    }

    Ok(HierarchicalTestResult { suite, cases })
}

/// Parse a report file; a missing file means the test wrote no report
pub fn parse_report_file(path: &Path) -> Result<Option<HierarchicalTestResult>, ReportError> {
    match fs::read_to_string(path) {
        Ok(xml) => parse_report(&xml).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ReportError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIXED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<testsuites>
  <testsuite name="MathTest" tests="4">
    <testcase name="testAdd" classname="MathTest" time="0.001" />
    <testcase name="testSub" classname="MathTest" time="0.002">
      <failure message="expected &lt;1&gt; but was &lt;2&gt;">stack</failure>
    </testcase>
    <testcase name="testDiv" classname="MathTest">
      <error message="division by zero"/>
    </testcase>
    <testcase name="testPow" classname="MathTest"><skipped/></testcase>
  </testsuite>
</testsuites>
"#;

    #[test]
    fn test_parses_outcomes() {
        let result = parse_report(MIXED).unwrap();
        assert_eq!(result.suite.as_deref(), Some("MathTest"));
        assert_eq!(result.total(), 4);
        assert_eq!(result.cases[0].outcome, CaseOutcome::Passed);
        assert_eq!(result.cases[1].outcome, CaseOutcome::Failed);
        assert_eq!(result.cases[2].outcome, CaseOutcome::Error);
        assert_eq!(result.cases[3].outcome, CaseOutcome::Skipped);
    }

    #[test]
    fn test_collects_failed_cases_with_messages() {
        let failed = parse_report(MIXED).unwrap().collect_failed_test_cases().unwrap();
        let names: Vec<_> = failed.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["testSub", "testDiv"]);
        assert_eq!(failed[0].message.as_deref(), Some("expected <1> but was <2>"));
        assert_eq!(failed[0].class_name.as_deref(), Some("MathTest"));
    }

    #[test]
    fn test_all_passing_has_no_failed_detail() {
        let xml = r#"<testsuite name="S"><testcase name="a"/><testcase name="b"></testcase></testsuite>"#;
        let result = parse_report(xml).unwrap();
        assert_eq!(result.total(), 2);
        assert!(result.collect_failed_test_cases().is_none());
    }

    #[test]
    fn test_not_xml() {
        assert!(matches!(parse_report("PASS: 3 tests"), Err(ReportError::NotXml)));
    }

    #[test]
    fn test_unterminated_case() {
        let xml = r#"<testsuite><testcase name="a"><failure message="x"></testsuite>"#;
        assert!(matches!(parse_report(xml), Err(ReportError::Unterminated)));
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let result = parse_report_file(&dir.path().join("test.xml")).unwrap();
        assert!(result.is_none());
    }
}
