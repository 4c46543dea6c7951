use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use thiserror::Error;

use crate::outerr::FileOutErr;

/// Resource estimate forwarded to the runner (informational for local runs)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ResourceHint {
    pub cpu: f64,
    pub memory_mb: f64,
}

/// A subprocess to run.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program followed by its arguments
    pub argv: Vec<String>,
    /// Complete environment; the parent environment is not inherited
    pub env: BTreeMap<String, String>,
    pub working_dir: PathBuf,
    pub resources: ResourceHint,
    /// Wall-clock limit, if any
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(argv: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            argv,
            env: BTreeMap::new(),
            working_dir: working_dir.into(),
            resources: ResourceHint::default(),
            timeout: None,
        }
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_resources(mut self, resources: ResourceHint) -> Self {
        self.resources = resources;
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }
}

/// A process that ran and exited zero.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub duration: Duration,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

/// Execution failures.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("empty command line")]
    EmptyCommand,

    #[error("failed to start {program}: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("process exited with {}", describe_exit(*.code, *.signal))]
    NonZeroExit {
        code: Option<i32>,
        signal: Option<i32>,
        duration: Duration,
    },

    #[error("process timed out after {after:?}")]
    TimedOut { after: Duration },

    #[error("cancelled")]
    Cancelled,

    #[error("I/O error while supervising process: {0}")]
    Io(#[from] io::Error),
}

fn describe_exit(code: Option<i32>, signal: Option<i32>) -> String {
    match (code, signal) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}

impl CommandError {
    /// True when the failure is not attributable to the command itself
    pub fn is_environmental(&self) -> bool {
        matches!(
            self,
            CommandError::EmptyCommand | CommandError::SpawnFailed { .. } | CommandError::Io(_)
        )
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::NonZeroExit { code, .. } => *code,
            _ => None,
        }
    }
}

/// Which pipe a streamed line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Receives output lines while they are written to the log files.
pub trait LineSink: Send + Sync {
    fn line(&self, stream: Stream, line: &str);
}

/// Runs subprocesses on behalf of execution strategies.
pub trait CommandRunner: Send + Sync {
    /// Run `spec`, writing stdout/stderr to `outerr` and, when given, to `tee`.
    ///
    /// Setting `cancel` terminates the process and yields
    /// [`CommandError::Cancelled`].
    fn run(
        &self,
        spec: &CommandSpec,
        outerr: &FileOutErr,
        tee: Option<&dyn LineSink>,
        cancel: &AtomicBool,
    ) -> Result<CommandOutput, CommandError>;
}
