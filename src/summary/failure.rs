//! Failure taxonomy and stable exit codes

use serde::{Deserialize, Serialize};

use crate::graph::EvalError;

/// Stable exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Everything built and every test passed
    Success = 0,
    /// A build step or the configuration failed
    BuildFailed = 1,
    /// Bad command line, config file or manifest
    Usage = 2,
    /// At least one test did not pass
    TestsFailed = 3,
    /// Interrupted by a signal
    Interrupted = 8,
    /// Infrastructure failure (I/O, process could not start)
    Environmental = 36,
    /// Internal consistency violation
    Internal = 37,
}

impl ExitCode {
    /// Get the integer value of the exit code
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Create from integer value
    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::BuildFailed),
            2 => Some(ExitCode::Usage),
            3 => Some(ExitCode::TestsFailed),
            8 => Some(ExitCode::Interrupted),
            36 => Some(ExitCode::Environmental),
            37 => Some(ExitCode::Internal),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }

    /// Higher wins when several failures occurred
    fn severity(&self) -> u8 {
        match self {
            ExitCode::Success => 0,
            ExitCode::TestsFailed => 1,
            ExitCode::BuildFailed => 2,
            ExitCode::Usage => 3,
            ExitCode::Environmental => 4,
            ExitCode::Interrupted => 5,
            ExitCode::Internal => 6,
        }
    }
}

impl Default for ExitCode {
    fn default() -> Self {
        ExitCode::Success
    }
}

/// Failure categories shown in the summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    InvalidConfiguration,
    Cycle,
    MissingInput,
    ActionFailed,
    TestFailed,
    Environmental,
    Interrupted,
    Internal,
}

impl FailureKind {
    /// Classify by root cause
    pub fn of(err: &EvalError) -> Self {
        match err.root_cause() {
            EvalError::InvalidConfiguration(_) => FailureKind::InvalidConfiguration,
            EvalError::Cycle { .. } => FailureKind::Cycle,
            EvalError::MissingInput(_) => FailureKind::MissingInput,
            EvalError::ActionFailed { .. } | EvalError::DependencyFailed { .. } => {
                FailureKind::ActionFailed
            }
            EvalError::TestExecutionAborted { .. } => FailureKind::TestFailed,
            EvalError::Environmental(_) => FailureKind::Environmental,
            EvalError::Interrupted => FailureKind::Interrupted,
            EvalError::Internal(_) => FailureKind::Internal,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        match self {
            FailureKind::InvalidConfiguration
            | FailureKind::Cycle
            | FailureKind::MissingInput
            | FailureKind::ActionFailed => ExitCode::BuildFailed,
            FailureKind::TestFailed => ExitCode::TestsFailed,
            FailureKind::Environmental => ExitCode::Environmental,
            FailureKind::Interrupted => ExitCode::Interrupted,
            FailureKind::Internal => ExitCode::Internal,
        }
    }
}

/// Folds many outcomes into one exit code, keeping the most severe
#[derive(Debug, Default)]
pub struct ExitCodeAggregator {
    worst: ExitCode,
}

impl ExitCodeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, code: ExitCode) {
        if code.severity() > self.worst.severity() {
            self.worst = code;
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        self.worst
    }
}
