//! Action inputs and outputs

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::node::ActionId;
use crate::graph::Key;

/// A file an action reads, identified by its exec-root relative path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Artifact {
    /// Checked-in file
    Source { path: PathBuf },
    /// Output of another action
    Derived { path: PathBuf, generated_by: ActionId },
}

impl Artifact {
    pub fn source(path: impl Into<PathBuf>) -> Self {
        Artifact::Source { path: path.into() }
    }

    pub fn derived(path: impl Into<PathBuf>, generated_by: ActionId) -> Self {
        Artifact::Derived {
            path: path.into(),
            generated_by,
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Artifact::Source { path } | Artifact::Derived { path, .. } => path,
        }
    }

    /// The graph key whose value materializes this artifact
    pub fn dependency_key(&self) -> Key {
        match self {
            Artifact::Source { path } => Key::FileState(path.clone()),
            Artifact::Derived { generated_by, .. } => Key::ActionExecution(generated_by.clone()),
        }
    }
}
