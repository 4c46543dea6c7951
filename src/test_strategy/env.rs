//! Test process environment
//!
//! Layered in order, later layers win: default test variables, the
//! configuration's shell environment, the configuration's test environment,
//! then `TEST_SRCDIR`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::action::TestActionInfo;

/// Directory of the test's source tree (the runfiles dir plus prefix)
pub fn source_root(exec_root: &Path, info: &TestActionInfo, runfiles_prefix: &str) -> PathBuf {
    exec_root.join(&info.runfiles_dir).join(runfiles_prefix)
}

pub fn tmp_dir(exec_root: &Path, info: &TestActionInfo) -> PathBuf {
    exec_root.join(&info.runfiles_dir).join("_tmp")
}

pub fn default_test_env(exec_root: &Path, info: &TestActionInfo) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("TEST_TARGET".to_string(), info.target.to_string());
    env.insert("TEST_TIMEOUT".to_string(), info.timeout_seconds.to_string());
    env.insert(
        "XML_OUTPUT_FILE".to_string(),
        exec_root.join(info.xml_path()).display().to_string(),
    );
    env.insert(
        "TEST_TMPDIR".to_string(),
        tmp_dir(exec_root, info).display().to_string(),
    );
    env.insert("TZ".to_string(), "UTC".to_string());
    env
}

pub fn test_env(
    exec_root: &Path,
    info: &TestActionInfo,
    runfiles_prefix: &str,
) -> BTreeMap<String, String> {
    let mut env = default_test_env(exec_root, info);
    env.extend(info.shell_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(info.test_env.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.insert(
        "TEST_SRCDIR".to_string(),
        source_root(exec_root, info, runfiles_prefix).display().to_string(),
    );
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::Label;

    fn info() -> TestActionInfo {
        let mut shell_env = BTreeMap::new();
        shell_env.insert("PATH".to_string(), "/usr/bin:/bin".to_string());
        shell_env.insert("LANG".to_string(), "en_US".to_string());
        shell_env.insert("TZ".to_string(), "Europe/Paris".to_string());
        let mut test_env = BTreeMap::new();
        test_env.insert("LANG".to_string(), "C".to_string());
        test_env.insert("TEST_SRCDIR".to_string(), "/ignored".to_string());
        TestActionInfo {
            target: Label::parse_absolute("//pkg:foo_test").unwrap(),
            executable: PathBuf::from("bin/pkg/foo_test"),
            args: Vec::new(),
            timeout_seconds: 60,
            runfiles_dir: PathBuf::from("bin/pkg/foo_test.runfiles"),
            log_dir: PathBuf::from("testlogs/pkg/foo_test"),
            shell_env,
            test_env,
        }
    }

    #[test]
    fn test_layers_override_in_order() {
        let env = test_env(Path::new("/exec"), &info(), "__main__");

        assert_eq!(env["TEST_TARGET"], "//pkg:foo_test");
        assert_eq!(env["TEST_TIMEOUT"], "60");
        assert_eq!(env["PATH"], "/usr/bin:/bin");
        // shell env overrides defaults, test env overrides shell env
        assert_eq!(env["TZ"], "Europe/Paris");
        assert_eq!(env["LANG"], "C");
        assert_eq!(env["TEST_SRCDIR"], "/exec/bin/pkg/foo_test.runfiles/__main__");
        assert_eq!(env["XML_OUTPUT_FILE"], "/exec/testlogs/pkg/foo_test/test.xml");
        assert_eq!(env["TEST_TMPDIR"], "/exec/bin/pkg/foo_test.runfiles/_tmp");
    }
}
