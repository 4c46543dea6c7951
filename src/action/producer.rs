//! Graph producers for source files and actions

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::artifact::Artifact;
use super::cache::ActionCache;
use super::engine::{EngineError, ExecutionEngine};
use super::graph::ActionGraph;
use super::node::{ActionGraphNode, ActionOutcome};
use super::strategy::ActionReport;
use crate::collab::{Digest, FileState, FileStore};
use crate::graph::{EvalError, Environment, Key, Value, ValueProducer};

/// Digests a source input below the exec root
pub struct FileStateProducer {
    exec_root: PathBuf,
    files: Arc<dyn FileStore>,
}

impl FileStateProducer {
    pub fn new(exec_root: impl Into<PathBuf>, files: Arc<dyn FileStore>) -> Self {
        Self {
            exec_root: exec_root.into(),
            files,
        }
    }
}

impl ValueProducer for FileStateProducer {
    fn produce(&self, key: &Key, _env: &mut Environment<'_>) -> Result<Value, EvalError> {
        let Key::FileState(path) = key else {
            return Err(EvalError::Internal(format!("file state producer asked for {key}")));
        };
        let absolute = self.exec_root.join(path);
        if !self.files.exists(&absolute) {
            return Err(EvalError::MissingInput(path.clone()));
        }
        let digest = self.files.digest(&absolute).map_err(|e| {
            EvalError::Environmental(format!("failed to digest {}: {e}", path.display()))
        })?;
        Ok(Value::FileState(FileState {
            path: path.clone(),
            digest,
            is_directory: self.files.is_directory(&absolute),
        }))
    }
}

/// Runs an action once its inputs are materialized
pub struct ActionExecutionProducer {
    graph: Arc<ActionGraph>,
    engine: Arc<ExecutionEngine>,
    cache: Arc<ActionCache>,
    files: Arc<dyn FileStore>,
    exec_root: PathBuf,
}

impl ActionExecutionProducer {
    pub fn new(
        graph: Arc<ActionGraph>,
        engine: Arc<ExecutionEngine>,
        cache: Arc<ActionCache>,
        files: Arc<dyn FileStore>,
        exec_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            graph,
            engine,
            cache,
            files,
            exec_root: exec_root.into(),
        }
    }

    fn input_digests(
        node: &ActionGraphNode,
        env: &mut Environment<'_>,
    ) -> Result<BTreeMap<PathBuf, Digest>, EvalError> {
        let keys: Vec<Key> = node.inputs.iter().map(Artifact::dependency_key).collect();
        let values = env.get_many(&keys);

        let mut digests = BTreeMap::new();
        for (input, value) in node.inputs.iter().zip(values) {
            let value = value?;
            let digest = match input {
                Artifact::Source { .. } => value.as_file_state()?.digest.clone(),
                Artifact::Derived { path, generated_by } => value
                    .as_action()?
                    .output_digests
                    .get(path)
                    .cloned()
                    .ok_or_else(|| {
                        EvalError::Internal(format!(
                            "action '{generated_by}' did not report output '{}'",
                            path.display()
                        ))
                    })?,
            };
            digests.insert(input.path().to_path_buf(), digest);
        }
        Ok(digests)
    }

    fn output_digests(
        &self,
        node: &ActionGraphNode,
    ) -> Result<BTreeMap<PathBuf, Digest>, EvalError> {
        node.outputs
            .iter()
            .map(|output| {
                self.files
                    .digest(&self.exec_root.join(output))
                    .map(|digest| (output.clone(), digest))
                    .map_err(|e| EvalError::ActionFailed {
                        mnemonic: node.mnemonic.clone(),
                        owner: node.owner.clone(),
                        message: format!("output '{}' is unreadable: {e}", output.display()),
                        cacheable: false,
                    })
            })
            .collect()
    }
}

impl ValueProducer for ActionExecutionProducer {
    fn produce(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, EvalError> {
        let Key::ActionExecution(id) = key else {
            return Err(EvalError::Internal(format!("action producer asked for {key}")));
        };
        let node = self
            .graph
            .get(id)
            .cloned()
            .ok_or_else(|| EvalError::Internal(format!("unknown action '{id}'")))?;

        let input_digests = Self::input_digests(&node, env)?;
        let cache_key = node
            .cache_key(&input_digests)
            .map_err(|e| EvalError::Internal(format!("cache key of '{id}': {e}")))?;

        if node.cacheable {
            if let Some(hit) = self.cache.lookup(&cache_key, &self.exec_root, self.files.as_ref()) {
                debug!(action = %id, "action cache hit");
                let mut outcome = (*hit).clone();
                outcome.from_cache = true;
                return Ok(Value::Action(Arc::new(outcome)));
            }
        }
        if env.is_interrupted() {
            return Err(EvalError::Interrupted);
        }

        let report = self
            .engine
            .submit(Arc::clone(&node))
            .and_then(|pending| pending.wait())
            .map_err(|e| match e {
                EngineError::Aborted { target } => EvalError::TestExecutionAborted { target },
                EngineError::Interrupted => EvalError::Interrupted,
                EngineError::NoStrategy { .. } | EngineError::Internal(_) => {
                    EvalError::Internal(e.to_string())
                }
            })?;

        match report {
            ActionReport::Success {
                cacheable,
                test_result,
            } => {
                let outcome = Arc::new(ActionOutcome {
                    id: node.id.clone(),
                    mnemonic: node.mnemonic.clone(),
                    owner: node.owner.clone(),
                    output_digests: self.output_digests(&node)?,
                    cacheable: cacheable && node.cacheable,
                    cache_key,
                    test_result,
                    from_cache: false,
                });
                self.cache.store(Arc::clone(&outcome));
                Ok(Value::Action(outcome))
            }
            ActionReport::Failure {
                cacheable, message, ..
            } => Err(EvalError::ActionFailed {
                mnemonic: node.mnemonic.clone(),
                owner: node.owner.clone(),
                message,
                cacheable,
            }),
            ActionReport::Fatal { message } => {
                warn!(action = %id, %message, "environmental failure");
                Err(EvalError::Environmental(message))
            }
        }
    }

    fn is_hermetic(&self) -> bool {
        false
    }
}
