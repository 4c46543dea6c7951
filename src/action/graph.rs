//! Action graph with exclusive output ownership

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use super::artifact::Artifact;
use super::node::{ActionGraphNode, ActionId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionGraphError {
    #[error("action '{0}' is already registered")]
    DuplicateAction(ActionId),

    #[error("output '{}' of action '{conflicting}' is already owned by action '{owner}'", .path.display())]
    DuplicateOutput {
        path: PathBuf,
        owner: ActionId,
        conflicting: ActionId,
    },

    #[error("input '{}' of action '{action}' names '{generator}' as its generator, which does not produce it", .path.display())]
    UnknownGenerator {
        action: ActionId,
        path: PathBuf,
        generator: ActionId,
    },
}

/// Nodes keyed by id; every output path has exactly one owner
#[derive(Debug, Default)]
pub struct ActionGraph {
    nodes: BTreeMap<ActionId, Arc<ActionGraphNode>>,
    owners: HashMap<PathBuf, ActionId>,
}

impl ActionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Rejected before anything runs when it declares an
    /// output another node (or the node itself) already declared.
    pub fn add(&mut self, node: ActionGraphNode) -> Result<Arc<ActionGraphNode>, ActionGraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(ActionGraphError::DuplicateAction(node.id));
        }
        let mut claimed = HashSet::new();
        for output in &node.outputs {
            if let Some(owner) = self.owners.get(output) {
                return Err(ActionGraphError::DuplicateOutput {
                    path: output.clone(),
                    owner: owner.clone(),
                    conflicting: node.id.clone(),
                });
            }
            if !claimed.insert(output) {
                return Err(ActionGraphError::DuplicateOutput {
                    path: output.clone(),
                    owner: node.id.clone(),
                    conflicting: node.id.clone(),
                });
            }
        }
        for output in &node.outputs {
            self.owners.insert(output.clone(), node.id.clone());
        }
        let node = Arc::new(node);
        self.nodes.insert(node.id.clone(), Arc::clone(&node));
        Ok(node)
    }

    pub fn get(&self, id: &ActionId) -> Option<&Arc<ActionGraphNode>> {
        self.nodes.get(id)
    }

    pub fn owner_of(&self, path: &Path) -> Option<&ActionId> {
        self.owners.get(path)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<ActionGraphNode>> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every derived input must be an output of the node it names
    pub fn validate(&self) -> Result<(), ActionGraphError> {
        for node in self.nodes.values() {
            for input in &node.inputs {
                if let Artifact::Derived { path, generated_by } = input {
                    if self.owners.get(path) != Some(generated_by) {
                        return Err(ActionGraphError::UnknownGenerator {
                            action: node.id.clone(),
                            path: path.clone(),
                            generator: generated_by.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packages::Label;

    fn node(id: &str, outputs: &[&str]) -> ActionGraphNode {
        ActionGraphNode::generic(
            id,
            "Genrule",
            Label::parse_absolute("//pkg:gen").unwrap(),
            vec!["true".to_string()],
        )
        .with_outputs(outputs.iter().map(PathBuf::from).collect())
    }

    #[test]
    fn test_duplicate_output_rejected() {
        let mut graph = ActionGraph::new();
        graph.add(node("a", &["out/x"])).unwrap();

        let err = graph.add(node("b", &["out/y", "out/x"])).unwrap_err();

        assert_eq!(
            err,
            ActionGraphError::DuplicateOutput {
                path: PathBuf::from("out/x"),
                owner: ActionId::new("a"),
                conflicting: ActionId::new("b"),
            }
        );
        // the rejected node claimed nothing
        assert_eq!(graph.owner_of(Path::new("out/y")), None);
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn test_duplicate_output_within_one_node() {
        let mut graph = ActionGraph::new();
        assert!(matches!(
            graph.add(node("a", &["out/x", "out/x"])),
            Err(ActionGraphError::DuplicateOutput { .. })
        ));
    }

    #[test]
    fn test_validate_derived_inputs() {
        let mut graph = ActionGraph::new();
        graph.add(node("gen", &["out/x"])).unwrap();
        graph
            .add(node("use", &["out/y"]).with_inputs(vec![Artifact::derived("out/x", ActionId::new("gen"))]))
            .unwrap();
        assert!(graph.validate().is_ok());

        graph
            .add(node("bad", &["out/z"]).with_inputs(vec![Artifact::derived("out/x", ActionId::new("use"))]))
            .unwrap();
        assert!(matches!(
            graph.validate(),
            Err(ActionGraphError::UnknownGenerator { .. })
        ));
    }
}
