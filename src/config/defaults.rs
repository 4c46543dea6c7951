//! Built-in defaults (layer 1)

use serde::{Deserialize, Serialize};

/// Built-in default configuration values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuiltinDefaults {
    /// Graph evaluation worker threads (default: 4)
    pub evaluator_workers: usize,

    /// Re-run clean producers and compare their output (default: false)
    pub check_determinism: bool,

    /// Action executor threads (default: 4)
    pub execution_jobs: usize,

    /// CPU budget shared by running actions (default: 4.0)
    pub execution_cpu: f64,

    /// Memory budget in MiB (default: 4096)
    pub execution_memory_mb: f64,

    /// Concurrently running local tests (default: 4)
    pub local_tests: f64,

    /// Continue scheduling tests after a failure (default: false)
    pub keep_going: bool,

    /// Test output mode (default: "summary")
    pub test_output: String,

    /// Script that wraps every test invocation
    pub setup_script: String,

    /// Directory inside the runfiles tree the tests run from
    pub runfiles_prefix: String,

    /// Per-test timeout in seconds (default: 300)
    pub test_timeout_seconds: u64,

    /// Wait between SIGTERM and SIGKILL (default: 5)
    pub termination_grace_seconds: u64,
}

impl Default for BuiltinDefaults {
    fn default() -> Self {
        Self {
            evaluator_workers: 4,
            check_determinism: false,
            execution_jobs: 4,
            execution_cpu: 4.0,
            execution_memory_mb: 4096.0,
            local_tests: 4.0,
            keep_going: false,
            test_output: "summary".to_string(),
            setup_script: "tools/test-setup.sh".to_string(),
            runfiles_prefix: "__main__".to_string(),
            test_timeout_seconds: 300,
            termination_grace_seconds: 5,
        }
    }
}

impl BuiltinDefaults {
    /// Convert to JSON Value for merging
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "evaluator": {
                "workers": self.evaluator_workers,
                "check_determinism": self.check_determinism
            },
            "execution": {
                "jobs": self.execution_jobs,
                "cpu": self.execution_cpu,
                "memory_mb": self.execution_memory_mb,
                "local_tests": self.local_tests,
                "strategies": {
                    "TestRunner": ["standalone"],
                    "WorkspaceStatus": ["workspace-status"]
                }
            },
            "test": {
                "keep_going": self.keep_going,
                "output": self.test_output,
                "setup_script": self.setup_script,
                "runfiles_prefix": self.runfiles_prefix,
                "timeout_seconds": self.test_timeout_seconds,
                "termination_grace_seconds": self.termination_grace_seconds
            },
            "workspace_status": {
                "stable": {}
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let defaults = BuiltinDefaults::default();
        assert_eq!(defaults.evaluator_workers, 4);
        assert_eq!(defaults.execution_jobs, 4);
        assert!(!defaults.keep_going);
        assert_eq!(defaults.test_output, "summary");
        assert_eq!(defaults.setup_script, "tools/test-setup.sh");
    }

    #[test]
    fn test_to_value() {
        let value = BuiltinDefaults::default().to_value();

        assert_eq!(value["evaluator"]["workers"], 4);
        assert_eq!(value["test"]["timeout_seconds"], 300);
        assert_eq!(value["execution"]["strategies"]["TestRunner"][0], "standalone");
    }
}
