//! Failure taxonomy for graph evaluation
//!
//! Failed values are committed to the store like successful ones, so every
//! error here is `Clone + PartialEq`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use super::key::Key;
use crate::packages::Label;

/// User-visible configuration conditions. Messages are shown verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidConfiguration {
    #[error("--fdo_optimize cannot accept targets that do not refer to input files")]
    FdoNotInputFile,

    #[error("The --fdo_optimize parameter you specified resolves to a file that does not exist")]
    FdoFileMissing,

    #[error("'{cpu}' is not a valid CPU. It should only consist of characters valid in labels")]
    InvalidCpu { cpu: String },

    #[error("The toolchain rule '{label}' does not exist")]
    ToolchainRuleMissing { label: Label },

    #[error("The label '{label}' is not a cc_toolchain rule")]
    NotCcToolchainRule { label: Label },

    #[error("{message}")]
    NoSuchTarget { message: String },

    #[error("invalid label '{input}' in {option}: {message}")]
    InvalidLabel {
        option: &'static str,
        input: String,
        message: String,
    },

    #[error("unable to follow redirects of {option} '{label}': {message}")]
    Redirect {
        option: &'static str,
        label: Label,
        message: String,
    },

    #[error("unable to read the toolchain descriptor in '{label}': {message}")]
    DescriptorUnavailable { label: Label, message: String },

    #[error("no toolchain in the descriptor matches cpu '{cpu}'{}", compiler_suffix(.compiler))]
    NoMatchingToolchain {
        cpu: String,
        compiler: Option<String>,
    },
}

fn compiler_suffix(compiler: &Option<String>) -> String {
    match compiler {
        Some(compiler) => format!(" and compiler '{compiler}'"),
        None => String::new(),
    }
}

/// Cycle path rendered as `a -> b -> a`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CyclePath(pub Vec<Key>);

impl CyclePath {
    pub fn contains(&self, key: &Key) -> bool {
        self.0.contains(key)
    }

    pub fn keys(&self) -> &[Key] {
        &self.0
    }
}

impl fmt::Display for CyclePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for key in &self.0 {
            write!(f, "{key} -> ")?;
        }
        match self.0.first() {
            Some(first) => write!(f, "{first}"),
            None => write!(f, "<empty>"),
        }
    }
}

/// Error committed as the value of a failed key
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(InvalidConfiguration),

    #[error("cycle in dependency graph: {path}")]
    Cycle { path: CyclePath },

    #[error("dependency {dependency} failed: {root_cause}")]
    DependencyFailed {
        dependency: Key,
        root_cause: Box<EvalError>,
    },

    #[error("missing input file '{}'", .0.display())]
    MissingInput(PathBuf),

    #[error("{mnemonic} action for {owner} failed: {message}")]
    ActionFailed {
        mnemonic: String,
        owner: Label,
        message: String,
        cacheable: bool,
    },

    #[error("environmental error: {0}")]
    Environmental(String),

    #[error("test {target} failed: aborting")]
    TestExecutionAborted { target: Label },

    #[error("evaluation interrupted")]
    Interrupted,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<InvalidConfiguration> for EvalError {
    fn from(err: InvalidConfiguration) -> Self {
        EvalError::InvalidConfiguration(err)
    }
}

impl EvalError {
    /// Whether this failure may be reused as a negative cache entry
    pub fn is_cacheable(&self) -> bool {
        match self {
            EvalError::InvalidConfiguration(_)
            | EvalError::Cycle { .. }
            | EvalError::MissingInput(_) => true,
            EvalError::DependencyFailed { root_cause, .. } => root_cause.is_cacheable(),
            EvalError::ActionFailed { cacheable, .. } => *cacheable,
            EvalError::Environmental(_)
            | EvalError::TestExecutionAborted { .. }
            | EvalError::Interrupted
            | EvalError::Internal(_) => false,
        }
    }

    /// Whether this failure stops the whole evaluation call
    pub fn is_halting(&self) -> bool {
        matches!(
            self,
            EvalError::Interrupted | EvalError::Internal(_) | EvalError::TestExecutionAborted { .. }
        )
    }

    /// The failure at the bottom of a dependency-failed chain
    pub fn root_cause(&self) -> &EvalError {
        match self {
            EvalError::DependencyFailed { root_cause, .. } => root_cause.root_cause(),
            other => other,
        }
    }

    pub fn dependency_failed(dependency: Key, cause: &EvalError) -> Self {
        EvalError::DependencyFailed {
            dependency,
            root_cause: Box::new(cause.root_cause().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(s: &str) -> Label {
        Label::parse_absolute(s).unwrap()
    }

    #[test]
    fn test_messages_are_verbatim() {
        assert_eq!(
            InvalidConfiguration::InvalidCpu { cpu: "k 8".to_string() }.to_string(),
            "'k 8' is not a valid CPU. It should only consist of characters valid in labels"
        );
        assert_eq!(
            InvalidConfiguration::ToolchainRuleMissing {
                label: label("//tools/cpp:cc-compiler-k8")
            }
            .to_string(),
            "The toolchain rule '//tools/cpp:cc-compiler-k8' does not exist"
        );
        assert_eq!(
            InvalidConfiguration::NoMatchingToolchain {
                cpu: "arm".to_string(),
                compiler: Some("gcc".to_string())
            }
            .to_string(),
            "no toolchain in the descriptor matches cpu 'arm' and compiler 'gcc'"
        );
    }

    #[test]
    fn test_cacheability() {
        assert!(EvalError::from(InvalidConfiguration::FdoFileMissing).is_cacheable());
        assert!(!EvalError::Environmental("disk".to_string()).is_cacheable());
        assert!(!EvalError::Interrupted.is_cacheable());

        let env = EvalError::dependency_failed(
            Key::Precomputed("x".to_string()),
            &EvalError::Environmental("disk".to_string()),
        );
        assert!(!env.is_cacheable());
    }

    #[test]
    fn test_root_cause_flattens() {
        let inner = EvalError::dependency_failed(
            Key::Precomputed("a".to_string()),
            &EvalError::MissingInput(PathBuf::from("src/a.c")),
        );
        let outer = EvalError::dependency_failed(Key::Precomputed("b".to_string()), &inner);

        match outer {
            EvalError::DependencyFailed { root_cause, .. } => {
                assert_eq!(*root_cause, EvalError::MissingInput(PathBuf::from("src/a.c")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_halting() {
        assert!(EvalError::Internal("x".to_string()).is_halting());
        assert!(EvalError::TestExecutionAborted { target: label("//t:t") }.is_halting());
        assert!(!EvalError::Cycle { path: CyclePath(vec![]) }.is_halting());
    }

    #[test]
    fn test_cycle_display() {
        let path = CyclePath(vec![
            Key::Precomputed("a".to_string()),
            Key::Precomputed("b".to_string()),
        ]);
        assert_eq!(path.to_string(), "precomputed:a -> precomputed:b -> precomputed:a");
    }
}
