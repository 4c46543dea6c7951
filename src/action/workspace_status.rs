//! Workspace status action
//!
//! Writes `stable-status.txt` (sorted `KEY value` lines, identical bytes
//! for identical settings) and `volatile-status.txt` (build id and
//! timestamp). The action is never cacheable.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::debug;

use super::node::{ActionGraphNode, ActionId, ActionKind};
use super::resources::ResourceSet;
use super::strategy::{ActionReport, ExecutionContext, ExecutionStrategy, StrategyError};
use crate::packages::Label;

pub const WORKSPACE_STATUS_MNEMONIC: &str = "WorkspaceStatus";
pub const STABLE_STATUS: &str = "stable-status.txt";
pub const VOLATILE_STATUS: &str = "volatile-status.txt";

/// The status node writing into `build_data_dir` (exec-root relative)
pub fn workspace_status_action(owner: Label, build_data_dir: &Path) -> ActionGraphNode {
    ActionGraphNode {
        id: ActionId::new("workspace-status"),
        mnemonic: WORKSPACE_STATUS_MNEMONIC.to_string(),
        owner,
        argv: Vec::new(),
        env: BTreeMap::new(),
        inputs: Vec::new(),
        outputs: vec![
            build_data_dir.join(STABLE_STATUS),
            build_data_dir.join(VOLATILE_STATUS),
        ],
        resources: ResourceSet::ZERO,
        execution_info: BTreeMap::new(),
        cacheable: false,
        kind: ActionKind::WorkspaceStatus,
    }
}

pub fn render_stable_status(stable: &BTreeMap<String, String>) -> String {
    stable.iter().map(|(key, value)| format!("{key} {value}\n")).collect()
}

pub struct WorkspaceStatusStrategy {
    stable: BTreeMap<String, String>,
    build_id: String,
}

impl WorkspaceStatusStrategy {
    pub fn new(stable: BTreeMap<String, String>, build_id: impl Into<String>) -> Self {
        Self {
            stable,
            build_id: build_id.into(),
        }
    }

    fn output<'a>(node: &'a ActionGraphNode, name: &str) -> Option<&'a PathBuf> {
        node.outputs
            .iter()
            .find(|path| path.file_name().is_some_and(|f| f == name))
    }
}

impl ExecutionStrategy for WorkspaceStatusStrategy {
    fn name(&self) -> &str {
        "workspace-status"
    }

    fn can_execute(&self, node: &ActionGraphNode) -> bool {
        matches!(node.kind, ActionKind::WorkspaceStatus)
    }

    fn execute(
        &self,
        node: &ActionGraphNode,
        ctx: &ExecutionContext,
    ) -> Result<ActionReport, StrategyError> {
        let (Some(stable), Some(volatile)) = (
            Self::output(node, STABLE_STATUS),
            Self::output(node, VOLATILE_STATUS),
        ) else {
            return Err(StrategyError::Internal(format!(
                "workspace status action '{}' lacks its status outputs",
                node.id
            )));
        };

        let volatile_text = format!(
            "BUILD_ID {}\nBUILD_TIMESTAMP {}\n",
            self.build_id,
            Utc::now().timestamp()
        );
        for (path, contents) in [
            (stable, render_stable_status(&self.stable)),
            (volatile, volatile_text),
        ] {
            if let Err(e) = ctx.files.write_bytes(&ctx.resolve(path), contents.as_bytes()) {
                return Ok(ActionReport::Fatal {
                    message: format!("failed to write {}: {e}", path.display()),
                });
            }
        }
        debug!(build_id = %self.build_id, "workspace status written");
        Ok(ActionReport::Success {
            cacheable: false,
            test_result: None,
        })
    }
}
