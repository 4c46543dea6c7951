//! End-to-end `keel test` runs over shell-script tests
#![cfg(unix)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use keel::action::ActionCache;
use keel::build::{Build, BuildOutcome, Manifest, MANIFEST_FILE_NAME};
use keel::config::Settings;
use keel::summary::TestLine;
use keel::ExitCode;
use keel_protocol::{TestResultRecord, TestStatus};

const OPTIONS: &str = r#"
[options]
cpu = "k8"
crosstool_top = "//tools/cpp:toolchain"
test_env = ["GREETING=hello"]

[[target]]
kind = "rule"
label = "//tools/cpp:toolchain"
rule_class = "cc_toolchain_suite"
"#;

const CC_TOOLCHAIN: &str = r#"
[[target]]
kind = "rule"
label = "//tools/cpp:cc-compiler-k8"
rule_class = "cc_toolchain"
"#;

const DESCRIPTOR: &str = r#"
[[toolchain]]
identifier = "gcc_k8"
target_cpu = "k8"
compiler = "gcc"
"#;

const FAILING_REPORT: &str = r#"<testsuite name="math">
  <testcase name="testAdd" classname="Math"/>
  <testcase name="testSub" classname="Math"><failure message="expected 1"/></testcase>
</testsuite>"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(tests: &str) -> Self {
        Self::with_targets(CC_TOOLCHAIN, tests)
    }

    fn with_targets(targets: &str, tests: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let fixture = Self { dir };
        fixture.write(MANIFEST_FILE_NAME, &format!("{OPTIONS}{targets}{tests}"));
        fixture.write("tools/cpp/BUILD", "");
        fixture.write("tools/cpp/CROSSTOOL.toml", DESCRIPTOR);
        fixture.script("tools/test-setup.sh", "exec \"$@\"");
        fixture
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn write(&self, relative: &str, contents: &str) {
        let path = self.root().join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn script(&self, relative: &str, body: &str) {
        self.write(relative, &format!("#!/bin/sh\n{body}\n"));
        let path = self.root().join(relative);
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn build(&self, settings: Settings) -> Build {
        let manifest = Manifest::load(&self.root().join(MANIFEST_FILE_NAME)).unwrap();
        Build::new(self.root(), manifest, settings)
    }

    fn run(&self, settings: Settings) -> BuildOutcome {
        self.build(settings).run().unwrap()
    }

    fn log_dir(&self, package: &str, name: &str) -> PathBuf {
        self.root()
            .join("keel-out/k8-gcc/testlogs")
            .join(package)
            .join(name)
    }
}

fn keep_going() -> Settings {
    let mut settings = Settings::default();
    settings.test.keep_going = true;
    settings
}

fn line<'a>(outcome: &'a BuildOutcome, target: &str) -> &'a TestLine {
    outcome
        .summary
        .tests
        .iter()
        .find(|t| t.target == target)
        .unwrap_or_else(|| panic!("no summary line for {target}: {:?}", outcome.summary))
}

#[test]
fn test_passing_and_failing_tests_with_keep_going() {
    let fx = Fixture::new(
        r#"
[[test]]
label = "//pkg:pass_test"
executable = "pkg/pass_test.sh"

[[test]]
label = "//pkg:fail_test"
executable = "pkg/fail_test.sh"
"#,
    );
    fx.script("pkg/pass_test.sh", "echo running");
    fx.script(
        "pkg/fail_test.sh",
        &format!("echo 'to stderr' >&2\ncat > \"$XML_OUTPUT_FILE\" <<'EOF'\n{FAILING_REPORT}\nEOF\nexit 1"),
    );

    let outcome = fx.run(keep_going());

    assert_eq!(outcome.exit_code, ExitCode::TestsFailed);
    assert_eq!(line(&outcome, "//pkg:pass_test").status, TestStatus::Passed);
    let failed = line(&outcome, "//pkg:fail_test");
    assert_eq!(failed.status, TestStatus::Failed);
    assert_eq!(failed.failed_test_cases.len(), 1);
    assert_eq!(failed.failed_test_cases[0].name, "testSub");
    assert_eq!(failed.failed_test_cases[0].message.as_deref(), Some("expected 1"));
    assert!(outcome.summary.failures.is_empty());

    let logs = fx.log_dir("pkg", "fail_test");
    let log = fs::read_to_string(logs.join("test.log")).unwrap();
    assert!(log.contains("to stderr"));
    assert!(!logs.join("test.err").exists());

    let record = TestResultRecord::from_file(&logs.join("test.result.json")).unwrap();
    assert_eq!(record.status, TestStatus::Failed);
    assert_eq!(record.exit_code, Some(1));
    assert!(!record.cacheable);

    assert!(fx.root().join("keel-out/build_summary.json").exists());
    let rendered = outcome.summary.render();
    assert!(rendered.contains("testSub: expected 1"));
}

#[test]
fn test_failing_test_aborts_without_keep_going() {
    let fx = Fixture::new(
        r#"
[[test]]
label = "//pkg:fail_test"
executable = "pkg/fail_test.sh"
"#,
    );
    fx.script("pkg/fail_test.sh", "exit 3");

    let outcome = fx.run(Settings::default());

    assert_eq!(outcome.exit_code, ExitCode::TestsFailed);
    assert_eq!(line(&outcome, "//pkg:fail_test").status, TestStatus::Failed);
    assert!(outcome
        .summary
        .failures
        .iter()
        .any(|f| f.message.contains("//pkg:fail_test")));
}

#[test]
fn test_environment_and_arguments() {
    let fx = Fixture::new(
        r#"
[[test]]
label = "//pkg:env_test"
executable = "pkg/env_test.sh"
args = ["--flag"]
"#,
    );
    fx.script(
        "pkg/env_test.sh",
        r#"[ "$TEST_TARGET" = "//pkg:env_test" ] || exit 2
[ "$TZ" = "UTC" ] || exit 3
[ "$GREETING" = "hello" ] || exit 4
[ -d "$TEST_TMPDIR" ] || exit 5
case "$TEST_SRCDIR" in
  */pkg/env_test.runfiles/__main__) ;;
  *) exit 6 ;;
esac
[ "$1" = "--flag" ] || exit 7
[ -n "$PATH" ] || exit 8"#,
    );

    let outcome = fx.run(Settings::default());

    assert_eq!(outcome.exit_code, ExitCode::Success, "{}", outcome.summary.render());
    assert_eq!(line(&outcome, "//pkg:env_test").status, TestStatus::Passed);
}

#[test]
fn test_timeout_is_reported() {
    let fx = Fixture::new(
        r#"
[[test]]
label = "//pkg:slow_test"
executable = "pkg/slow_test.sh"
timeout_seconds = 1
"#,
    );
    fx.script("pkg/slow_test.sh", "sleep 30");
    let mut settings = keep_going();
    settings.test.termination_grace_seconds = 1;

    let outcome = fx.run(settings);

    assert_eq!(outcome.exit_code, ExitCode::TestsFailed);
    assert_eq!(line(&outcome, "//pkg:slow_test").status, TestStatus::Timeout);
}

#[test]
fn test_missing_test_executable_fails_the_build() {
    let fx = Fixture::new(
        r#"
[[test]]
label = "//pkg:ghost_test"
executable = "pkg/ghost_test.sh"
"#,
    );

    let outcome = fx.run(keep_going());

    assert_eq!(outcome.exit_code, ExitCode::BuildFailed);
    assert!(outcome.summary.tests.is_empty());
    assert!(outcome.summary.failures[0]
        .message
        .contains("missing input file 'pkg/ghost_test.sh'"));
}

#[test]
fn test_unspawnable_setup_script_is_environmental() {
    let fx = Fixture::new(
        r#"
[[test]]
label = "//pkg:pass_test"
executable = "pkg/pass_test.sh"
"#,
    );
    fx.script("pkg/pass_test.sh", "exit 0");
    // present as an input, but cannot be executed
    let setup = fx.root().join("tools/test-setup.sh");
    fs::set_permissions(&setup, fs::Permissions::from_mode(0o644)).unwrap();

    let outcome = fx.run(keep_going());

    assert_eq!(outcome.exit_code, ExitCode::Environmental);
    assert!(outcome.summary.tests.is_empty());
    assert!(outcome
        .summary
        .failures
        .iter()
        .any(|f| f.message.contains("failed to start")));
    assert!(!fx
        .log_dir("pkg", "pass_test")
        .join("test.result.json")
        .exists());
}

#[test]
fn test_invalid_configuration_is_a_usage_error() {
    let fx = Fixture::with_targets(
        "",
        r#"
[[test]]
label = "//pkg:pass_test"
executable = "pkg/pass_test.sh"
"#,
    );
    fx.script("pkg/pass_test.sh", "exit 0");

    let outcome = fx.run(Settings::default());

    assert_eq!(outcome.exit_code, ExitCode::Usage);
    assert!(outcome.summary.tests.is_empty());
    assert!(outcome.summary.failures[0]
        .message
        .contains("The toolchain rule '//tools/cpp:cc-compiler-k8' does not exist"));
}

#[test]
fn test_workspace_status_files() {
    let fx = Fixture::new("");
    let mut settings = Settings::default();
    settings.workspace_status.stable =
        BTreeMap::from([("BUILD_USER".to_string(), "ci".to_string())]);

    let outcome = fx.run(settings);

    assert_eq!(outcome.exit_code, ExitCode::Success);
    let data = fx.root().join("keel-out/build-data");
    assert_eq!(
        fs::read_to_string(data.join("stable-status.txt")).unwrap(),
        "BUILD_USER ci\n"
    );
    let volatile = fs::read_to_string(data.join("volatile-status.txt")).unwrap();
    assert!(volatile.contains(&format!("BUILD_ID {}", outcome.summary.build_id)));
    assert!(volatile.contains("BUILD_TIMESTAMP "));
}

#[test]
fn test_passing_result_is_reused_from_action_cache() {
    let fx = Fixture::new(
        r#"
[[test]]
label = "//pkg:counted_test"
executable = "pkg/counted_test.sh"
args = ["runs.txt"]
"#,
    );
    fx.script("pkg/counted_test.sh", "echo run >> \"$1\"");
    let cache = Arc::new(ActionCache::new());

    let first = fx
        .build(Settings::default())
        .with_action_cache(Arc::clone(&cache))
        .run()
        .unwrap();
    let second = fx
        .build(Settings::default())
        .with_action_cache(Arc::clone(&cache))
        .run()
        .unwrap();

    assert_eq!(first.exit_code, ExitCode::Success);
    assert!(!line(&first, "//pkg:counted_test").cached);
    assert_eq!(second.exit_code, ExitCode::Success);
    assert!(line(&second, "//pkg:counted_test").cached);
    assert_eq!(fs::read_to_string(fx.root().join("runs.txt")).unwrap(), "run\n");
}
