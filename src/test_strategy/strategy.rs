//! Standalone test strategy
//!
//! Runs a test binary through the setup script in the exec root, writes its
//! combined log, reads the structured report the test left behind and turns
//! the outcome into a persisted result record.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use keel_exec::{CommandError, CommandSpec, FileOutErr, LineSink, ResourceHint};
use keel_protocol::{parse_report_file, FailedTestCase, TestResultRecord, TestStatus};
use tracing::{debug, info, warn};

use super::env::{source_root, test_env, tmp_dir};
use super::phase::{PhaseTracker, TestPhase};
use crate::action::{
    ActionGraphNode, ActionReport, ExecutionContext, ExecutionStrategy, StrategyError,
    TestActionInfo,
};
use crate::collab::{Event, ReporterSink};
use crate::config::{TestOutput, TestSettings};

pub const TEST_MNEMONIC: &str = "TestRunner";

#[derive(Debug, Clone)]
pub struct TestStrategySettings {
    /// Keep running other tests after one did not pass
    pub keep_going: bool,
    pub output: TestOutput,
    /// Exec-root relative wrapper every test runs under
    pub setup_script: PathBuf,
    pub runfiles_prefix: String,
}

impl From<&TestSettings> for TestStrategySettings {
    fn from(settings: &TestSettings) -> Self {
        Self {
            keep_going: settings.keep_going,
            output: settings.output,
            setup_script: PathBuf::from(&settings.setup_script),
            runfiles_prefix: settings.runfiles_prefix.clone(),
        }
    }
}

pub struct StandaloneTestStrategy {
    settings: TestStrategySettings,
}

/// Outcome of the spawned process, before the report is read
struct Execution {
    status: TestStatus,
    cacheable: bool,
    exit_code: Option<i32>,
}

impl StandaloneTestStrategy {
    pub fn new(settings: TestStrategySettings) -> Self {
        Self { settings }
    }

    fn argv(&self, exec_root: &Path, info: &TestActionInfo) -> Vec<String> {
        let mut argv = vec![
            exec_root.join(&self.settings.setup_script).display().to_string(),
            info.executable.display().to_string(),
        ];
        argv.extend(info.args.iter().cloned());
        argv
    }

    fn prepare_runfiles(&self, ctx: &ExecutionContext, info: &TestActionInfo) -> io::Result<()> {
        let exec_root = &ctx.exec_root;
        ctx.files
            .create_directories(&source_root(exec_root, info, &self.settings.runfiles_prefix))?;
        ctx.files.create_directories(&tmp_dir(exec_root, info))?;
        ctx.files.create_directories(&ctx.resolve(&info.log_dir))?;
        // a report left by a previous run must not be attributed to this one
        match fs::remove_file(ctx.resolve(&info.xml_path())) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    fn failed_test_cases(xml: &Path) -> Option<Vec<FailedTestCase>> {
        match parse_report_file(xml) {
            Ok(report) => report.and_then(|r| r.collect_failed_test_cases()),
            Err(e) => {
                warn!(report = %xml.display(), error = %e, "unreadable test report");
                None
            }
        }
    }

    fn fatal(ctx: &ExecutionContext, message: String) -> ActionReport {
        ctx.reporter.post(Event::Error(message.clone()));
        ActionReport::Fatal { message }
    }
}

fn advance(tracker: &mut PhaseTracker, to: TestPhase) -> Result<(), StrategyError> {
    tracker.advance(to).map_err(StrategyError::Internal)
}

impl ExecutionStrategy for StandaloneTestStrategy {
    fn name(&self) -> &str {
        "standalone"
    }

    fn can_execute(&self, node: &ActionGraphNode) -> bool {
        node.test_info().is_some()
    }

    fn execute(
        &self,
        node: &ActionGraphNode,
        ctx: &ExecutionContext,
    ) -> Result<ActionReport, StrategyError> {
        let info = node.test_info().ok_or_else(|| {
            StrategyError::Internal(format!("'{}' is not a test action", node.id))
        })?;
        let mut phase = PhaseTracker::new();
        let exec_root = &ctx.exec_root;

        if let Err(e) = self.prepare_runfiles(ctx, info) {
            return Ok(Self::fatal(ctx, format!("Caught I/O exception: {e}")));
        }
        let spec = CommandSpec::new(self.argv(exec_root, info), exec_root)
            .with_env(test_env(exec_root, info, &self.settings.runfiles_prefix))
            .with_timeout(Some(Duration::from_secs(info.timeout_seconds)))
            .with_resources(ResourceHint {
                cpu: node.resources.cpu,
                memory_mb: node.resources.memory_mb,
            });
        let outerr = FileOutErr::create(ctx.resolve(&info.log_path()), ctx.resolve(&info.err_path()));
        let outerr = match outerr {
            Ok(outerr) => outerr,
            Err(e) => return Ok(Self::fatal(ctx, format!("Caught I/O exception: {e}"))),
        };

        advance(&mut phase, TestPhase::Spawning)?;
        let started_at = Utc::now();
        let sink = match self.settings.output {
            TestOutput::Streamed => Some(ReporterSink::new(
                info.target.to_string(),
                ctx.reporter.clone(),
            )),
            TestOutput::Summary => None,
        };
        debug!(target_label = %info.target, "spawning test");

        advance(&mut phase, TestPhase::Running)?;
        let run = ctx.runner.run(
            &spec,
            &outerr,
            sink.as_ref().map(|s| s as &dyn LineSink),
            &ctx.cancel,
        );

        advance(&mut phase, TestPhase::CollectingResult)?;
        let execution = match run {
            Ok(output) => Execution {
                status: TestStatus::Passed,
                cacheable: true,
                exit_code: Some(output.exit_code),
            },
            Err(e) if e.is_environmental() => {
                drop(outerr);
                return Ok(Self::fatal(ctx, format!("{}: {e}", info.target)));
            }
            // failures are never cached, whatever the reason
            Err(CommandError::NonZeroExit { code, .. }) => Execution {
                status: TestStatus::Failed,
                cacheable: false,
                exit_code: code,
            },
            Err(CommandError::TimedOut { .. }) => Execution {
                status: TestStatus::Timeout,
                cacheable: false,
                exit_code: None,
            },
            Err(CommandError::Cancelled) => Execution {
                status: TestStatus::Incomplete,
                cacheable: false,
                exit_code: None,
            },
            Err(e) => {
                warn!(target_label = %info.target, error = %e, "test execution failed");
                Execution {
                    status: TestStatus::Failed,
                    cacheable: false,
                    exit_code: e.exit_code(),
                }
            }
        };

        let test_log = match outerr.append_err_to_out() {
            Ok(log) => log,
            Err(e) => return Ok(Self::fatal(ctx, format!("Caught I/O exception: {e}"))),
        };
        let xml_output = ctx.resolve(&info.xml_path());
        let failed_cases = Self::failed_test_cases(&xml_output);
        let record = TestResultRecord::new(
            info.target.to_string(),
            execution.status,
            execution.cacheable,
            test_log,
            xml_output,
            started_at,
        )
        .with_exit_code(execution.exit_code)
        .with_failed_test_cases(failed_cases);
        if let Err(e) = record.write_to_file(&ctx.resolve(&info.result_path())) {
            return Ok(Self::fatal(ctx, format!("Caught I/O exception: {e}")));
        }

        advance(&mut phase, TestPhase::Finalized)?;
        info!(
            target_label = %info.target,
            status = %record.status,
            duration_ms = record.duration_ms,
            "test finished"
        );
        ctx.reporter.post(Event::TestResult(record.clone()));

        if record.status == TestStatus::Incomplete {
            return Err(StrategyError::Interrupted);
        }
        if !record.passed() && !self.settings.keep_going {
            return Err(StrategyError::Aborted {
                target: info.target.clone(),
            });
        }
        if record.passed() {
            Ok(ActionReport::Success {
                cacheable: record.cacheable,
                test_result: Some(record),
            })
        } else {
            Ok(ActionReport::Failure {
                cacheable: record.cacheable,
                message: format!("test {}", record.status),
                test_result: Some(record),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    use keel_exec::{CommandOutput, CommandRunner};
    use tempfile::TempDir;

    use super::*;
    use crate::action::ActionKind;
    use crate::collab::{CollectingReporter, EventReporter, LocalFileStore};
    use crate::packages::Label;

    const REPORT: &str = r#"<testsuite name="suite">
<testcase name="testOk" classname="Suite"/>
<testcase name="testBroken" classname="Suite"><failure message="boom"/></testcase>
</testsuite>"#;

    #[derive(Clone, Copy)]
    enum Script {
        Exit(i32),
        Timeout,
        Cancel,
        SpawnFail,
    }

    /// Pretends to run the test: writes a log line, optionally a report,
    /// and returns the scripted outcome
    struct ScriptedRunner {
        script: Script,
        report: Option<&'static str>,
        seen: Mutex<Option<CommandSpec>>,
    }

    impl ScriptedRunner {
        fn new(script: Script) -> Self {
            Self {
                script,
                report: None,
                seen: Mutex::new(None),
            }
        }

        fn with_report(mut self, report: &'static str) -> Self {
            self.report = Some(report);
            self
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(
            &self,
            spec: &CommandSpec,
            outerr: &FileOutErr,
            _tee: Option<&dyn LineSink>,
            _cancel: &AtomicBool,
        ) -> Result<CommandOutput, CommandError> {
            *self.seen.lock().unwrap() = Some(spec.clone());
            let duration = Duration::from_millis(5);
            if let Script::SpawnFail = self.script {
                return Err(CommandError::SpawnFailed {
                    program: spec.argv[0].clone(),
                    source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
                });
            }
            writeln!(outerr.out(), "stdout line")?;
            writeln!(outerr.err(), "stderr line")?;
            if let Some(report) = self.report {
                fs::write(&spec.env["XML_OUTPUT_FILE"], report)?;
            }
            match self.script {
                Script::Exit(0) => Ok(CommandOutput {
                    exit_code: 0,
                    duration,
                    stdout: outerr.out_path().to_path_buf(),
                    stderr: outerr.err_path().to_path_buf(),
                }),
                Script::Exit(code) => Err(CommandError::NonZeroExit {
                    code: Some(code),
                    signal: None,
                    duration,
                }),
                Script::Timeout => Err(CommandError::TimedOut { after: duration }),
                Script::Cancel => Err(CommandError::Cancelled),
                Script::SpawnFail => unreachable!(),
            }
        }
    }

    struct Fixture {
        dir: TempDir,
        runner: Arc<ScriptedRunner>,
        reporter: Arc<CollectingReporter>,
    }

    impl Fixture {
        fn new(runner: ScriptedRunner) -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                runner: Arc::new(runner),
                reporter: Arc::new(CollectingReporter::new()),
            }
        }

        fn context(&self) -> ExecutionContext {
            let runner: Arc<dyn keel_exec::CommandRunner> = self.runner.clone();
            let reporter: Arc<dyn EventReporter> = self.reporter.clone();
            ExecutionContext {
                exec_root: self.dir.path().to_path_buf(),
                runner,
                files: Arc::new(LocalFileStore),
                reporter,
                cancel: Arc::new(AtomicBool::new(false)),
            }
        }

        fn run(&self, keep_going: bool) -> Result<ActionReport, StrategyError> {
            let strategy = StandaloneTestStrategy::new(TestStrategySettings {
                keep_going,
                output: TestOutput::Summary,
                setup_script: PathBuf::from("tools/test-setup.sh"),
                runfiles_prefix: "__main__".to_string(),
            });
            strategy.execute(&node(), &self.context())
        }

        fn log_dir(&self) -> PathBuf {
            self.dir.path().join("testlogs/pkg/unit_test")
        }
    }

    fn node() -> ActionGraphNode {
        let target = Label::parse_absolute("//pkg:unit_test").unwrap();
        let info = TestActionInfo {
            target: target.clone(),
            executable: PathBuf::from("bin/pkg/unit_test"),
            args: vec!["--verbose".to_string()],
            timeout_seconds: 30,
            runfiles_dir: PathBuf::from("bin/pkg/unit_test.runfiles"),
            log_dir: PathBuf::from("testlogs/pkg/unit_test"),
            shell_env: BTreeMap::from([("PATH".to_string(), "/bin".to_string())]),
            test_env: BTreeMap::new(),
        };
        ActionGraphNode::generic("test //pkg:unit_test", TEST_MNEMONIC, target, Vec::new())
            .with_kind(ActionKind::Test(Box::new(info)))
    }

    #[test]
    fn test_pass_is_cacheable_and_recorded() {
        let fx = Fixture::new(ScriptedRunner::new(Script::Exit(0)));

        let report = fx.run(false).unwrap();

        let ActionReport::Success {
            cacheable: true,
            test_result: Some(record),
        } = report
        else {
            panic!("expected a cacheable success, got {report:?}");
        };
        assert_eq!(record.status, TestStatus::Passed);
        assert_eq!(record.exit_code, Some(0));
        assert_eq!(fx.reporter.test_results(), vec![record.clone()]);

        let stored = TestResultRecord::from_file(&fx.log_dir().join("test.result.json")).unwrap();
        assert_eq!(stored.status, TestStatus::Passed);
        let log = fs::read_to_string(fx.log_dir().join("test.log")).unwrap();
        assert_eq!(log, "stdout line\nstderr line\n");
        assert!(!fx.log_dir().join("test.err").exists());
    }

    #[test]
    fn test_command_line_and_working_directory() {
        let fx = Fixture::new(ScriptedRunner::new(Script::Exit(0)));

        fx.run(false).unwrap();

        let spec = fx.runner.seen.lock().unwrap().clone().unwrap();
        let setup = fx.dir.path().join("tools/test-setup.sh");
        assert_eq!(
            spec.argv,
            vec![
                setup.display().to_string(),
                "bin/pkg/unit_test".to_string(),
                "--verbose".to_string()
            ]
        );
        assert_eq!(spec.working_dir, fx.dir.path());
        assert_eq!(spec.timeout, Some(Duration::from_secs(30)));
        assert_eq!(spec.env["TEST_TARGET"], "//pkg:unit_test");
        assert!(fx
            .dir
            .path()
            .join("bin/pkg/unit_test.runfiles/__main__")
            .is_dir());
    }

    #[test]
    fn test_failure_with_keep_going_reports_failed_cases() {
        let fx = Fixture::new(ScriptedRunner::new(Script::Exit(1)).with_report(REPORT));

        let report = fx.run(true).unwrap();

        let ActionReport::Failure {
            cacheable: false,
            test_result: Some(record),
            ..
        } = report
        else {
            panic!("expected a non-cacheable failure, got {report:?}");
        };
        assert_eq!(record.status, TestStatus::Failed);
        assert_eq!(record.exit_code, Some(1));
        let cases = record.failed_test_cases.unwrap();
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].name, "testBroken");
    }

    #[test]
    fn test_failure_without_keep_going_aborts() {
        let fx = Fixture::new(ScriptedRunner::new(Script::Exit(2)));

        let err = fx.run(false).unwrap_err();

        assert_eq!(
            err,
            StrategyError::Aborted {
                target: Label::parse_absolute("//pkg:unit_test").unwrap()
            }
        );
        // the result is still recorded before the abort
        assert_eq!(fx.reporter.test_results()[0].status, TestStatus::Failed);
    }

    #[test]
    fn test_timeout_is_not_cacheable() {
        let fx = Fixture::new(ScriptedRunner::new(Script::Timeout));

        let report = fx.run(true).unwrap();

        let ActionReport::Failure {
            cacheable,
            test_result: Some(record),
            ..
        } = report
        else {
            panic!("expected a failure, got {report:?}");
        };
        assert!(!cacheable);
        assert_eq!(record.status, TestStatus::Timeout);
    }

    #[test]
    fn test_cancellation_is_incomplete_and_interrupts() {
        let fx = Fixture::new(ScriptedRunner::new(Script::Cancel));

        let err = fx.run(true).unwrap_err();

        assert_eq!(err, StrategyError::Interrupted);
        assert_eq!(fx.reporter.test_results()[0].status, TestStatus::Incomplete);
    }

    #[test]
    fn test_spawn_failure_is_environmental() {
        let fx = Fixture::new(ScriptedRunner::new(Script::SpawnFail));

        let report = fx.run(true).unwrap();

        assert!(matches!(report, ActionReport::Fatal { .. }));
        assert!(fx.reporter.test_results().is_empty());
        assert_eq!(fx.reporter.errors().len(), 1);
    }

    #[test]
    fn test_stale_report_is_not_reused() {
        let fx = Fixture::new(ScriptedRunner::new(Script::Exit(0)));
        fs::create_dir_all(fx.log_dir()).unwrap();
        fs::write(fx.log_dir().join("test.xml"), REPORT).unwrap();

        let report = fx.run(false).unwrap();

        let ActionReport::Success {
            test_result: Some(record),
            ..
        } = report
        else {
            panic!("expected a success, got {report:?}");
        };
        assert_eq!(record.failed_test_cases, None);
    }
}
