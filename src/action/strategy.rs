//! Execution strategies and their registry
//!
//! Several strategies may be able to run the same node. Which one does is
//! decided once per mnemonic from an ordered list of strategy names; the
//! first registered strategy with a listed name that accepts the node wins.

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use keel_exec::{CommandError, CommandRunner, CommandSpec, FileOutErr, ResourceHint};
use keel_protocol::TestResultRecord;
use thiserror::Error;
use tracing::{debug, warn};

use super::node::ActionGraphNode;
use crate::collab::{EventReporter, FileStore};
use crate::packages::Label;

/// Classified result of running a node
#[derive(Debug, Clone, PartialEq)]
pub enum ActionReport {
    Success {
        cacheable: bool,
        test_result: Option<TestResultRecord>,
    },
    /// The work ran and failed
    Failure {
        cacheable: bool,
        message: String,
        test_result: Option<TestResultRecord>,
    },
    /// The work could not be run at all
    Fatal { message: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    /// A test did not pass and the build must not continue
    #[error("test {target} did not pass; stopping the build")]
    Aborted { target: Label },

    #[error("interrupted")]
    Interrupted,

    #[error("internal strategy error: {0}")]
    Internal(String),
}

/// Collaborators shared by every strategy invocation
#[derive(Clone)]
pub struct ExecutionContext {
    pub exec_root: PathBuf,
    pub runner: Arc<dyn CommandRunner>,
    pub files: Arc<dyn FileStore>,
    pub reporter: Arc<dyn EventReporter>,
    pub cancel: Arc<AtomicBool>,
}

impl ExecutionContext {
    pub fn resolve(&self, relative: &Path) -> PathBuf {
        self.exec_root.join(relative)
    }
}

pub trait ExecutionStrategy: Send + Sync {
    fn name(&self) -> &str;

    fn can_execute(&self, node: &ActionGraphNode) -> bool;

    fn execute(
        &self,
        node: &ActionGraphNode,
        ctx: &ExecutionContext,
    ) -> Result<ActionReport, StrategyError>;
}

/// Registered strategies in registration order
#[derive(Clone, Default)]
pub struct StrategyRegistry {
    strategies: Vec<Arc<dyn ExecutionStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: impl ExecutionStrategy + 'static) -> &mut Self {
        self.strategies.push(Arc::new(strategy));
        self
    }

    /// First strategy, in `priority` order, that accepts `node`
    pub fn resolve(
        &self,
        node: &ActionGraphNode,
        priority: &[String],
    ) -> Option<Arc<dyn ExecutionStrategy>> {
        priority.iter().find_map(|name| {
            self.strategies
                .iter()
                .find(|s| s.name() == name && s.can_execute(node))
                .cloned()
        })
    }

    pub fn names(&self) -> Vec<&str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

/// Runs a generic action's command line in the exec root
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalStrategy;

impl LocalStrategy {
    fn log_paths(node: &ActionGraphNode) -> (PathBuf, PathBuf) {
        let dir = Path::new("_logs").join(node.id.as_str());
        (dir.join("stdout"), dir.join("stderr"))
    }

    fn missing_output(node: &ActionGraphNode, ctx: &ExecutionContext) -> Option<PathBuf> {
        node.outputs
            .iter()
            .find(|output| !ctx.files.exists(&ctx.resolve(output)))
            .cloned()
    }
}

impl ExecutionStrategy for LocalStrategy {
    fn name(&self) -> &str {
        "local"
    }

    fn can_execute(&self, node: &ActionGraphNode) -> bool {
        !node.argv.is_empty()
    }

    fn execute(
        &self,
        node: &ActionGraphNode,
        ctx: &ExecutionContext,
    ) -> Result<ActionReport, StrategyError> {
        for output in &node.outputs {
            if let Some(parent) = ctx.resolve(output).parent() {
                if let Err(e) = ctx.files.create_directories(parent) {
                    return Ok(ActionReport::Fatal {
                        message: format!(
                            "failed to create output directory {}: {e}",
                            parent.display()
                        ),
                    });
                }
            }
        }
        let (out, err) = Self::log_paths(node);
        let outerr = match FileOutErr::create(ctx.resolve(&out), ctx.resolve(&err)) {
            Ok(outerr) => outerr,
            Err(e) => {
                return Ok(ActionReport::Fatal {
                    message: format!("failed to open action logs: {e}"),
                })
            }
        };
        let spec = CommandSpec::new(node.argv.clone(), &ctx.exec_root)
            .with_env(node.env.clone())
            .with_resources(ResourceHint {
                cpu: node.resources.cpu,
                memory_mb: node.resources.memory_mb,
            });

        debug!(action = %node.id, mnemonic = %node.mnemonic, "running action");
        match ctx.runner.run(&spec, &outerr, None, &ctx.cancel) {
            Ok(_) => match Self::missing_output(node, ctx) {
                None => Ok(ActionReport::Success {
                    cacheable: node.cacheable,
                    test_result: None,
                }),
                Some(path) => Ok(ActionReport::Failure {
                    cacheable: false,
                    message: format!("output '{}' was not created", path.display()),
                    test_result: None,
                }),
            },
            Err(CommandError::Cancelled) => Err(StrategyError::Interrupted),
            Err(e) if e.is_environmental() => {
                warn!(action = %node.id, error = %e, "action could not be started");
                Ok(ActionReport::Fatal { message: e.to_string() })
            }
            Err(e) => Ok(ActionReport::Failure {
                cacheable: false,
                message: e.to_string(),
                test_result: None,
            }),
        }
    }
}
