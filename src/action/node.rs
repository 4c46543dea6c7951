//! Action graph nodes and their execution outcomes

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use keel_protocol::TestResultRecord;
use serde::{Deserialize, Serialize};

use super::artifact::Artifact;
use super::resources::ResourceSet;
use crate::collab::Digest;
use crate::packages::Label;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything a test strategy needs beyond the generic command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestActionInfo {
    pub target: Label,
    /// Exec-root relative path of the test binary
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub timeout_seconds: u64,
    /// Exec-root relative runfiles directory (working tree of the test)
    pub runfiles_dir: PathBuf,
    /// Exec-root relative directory for test.log, test.xml, test.result.json
    pub log_dir: PathBuf,
    pub shell_env: BTreeMap<String, String>,
    pub test_env: BTreeMap<String, String>,
}

impl TestActionInfo {
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join("test.log")
    }

    pub fn err_path(&self) -> PathBuf {
        self.log_dir.join("test.err")
    }

    pub fn xml_path(&self) -> PathBuf {
        self.log_dir.join("test.xml")
    }

    pub fn result_path(&self) -> PathBuf {
        self.log_dir.join("test.result.json")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionKind {
    Generic,
    WorkspaceStatus,
    Test(Box<TestActionInfo>),
}

/// A unit of subprocess work with declared inputs and outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionGraphNode {
    pub id: ActionId,
    /// Strategy selector, e.g. `TestRunner`
    pub mnemonic: String,
    pub owner: Label,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub inputs: Vec<Artifact>,
    /// Exec-root relative paths this action exclusively writes
    pub outputs: Vec<PathBuf>,
    pub resources: ResourceSet,
    #[serde(default)]
    pub execution_info: BTreeMap<String, String>,
    /// False for actions whose results must never be reused
    pub cacheable: bool,
    pub kind: ActionKind,
}

/// Inputs of the action cache key, hashed as canonical JSON
#[derive(Serialize)]
struct CacheKeyInputs<'a> {
    mnemonic: &'a str,
    argv: &'a [String],
    env: &'a BTreeMap<String, String>,
    inputs: &'a BTreeMap<PathBuf, Digest>,
    outputs: &'a [PathBuf],
    execution_info: &'a BTreeMap<String, String>,
    kind: &'a ActionKind,
}

impl ActionGraphNode {
    pub fn generic(
        id: impl Into<String>,
        mnemonic: impl Into<String>,
        owner: Label,
        argv: Vec<String>,
    ) -> Self {
        Self {
            id: ActionId::new(id),
            mnemonic: mnemonic.into(),
            owner,
            argv,
            env: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            resources: ResourceSet::new(1.0, 250.0, 0.0),
            execution_info: BTreeMap::new(),
            cacheable: true,
            kind: ActionKind::Generic,
        }
    }

    pub fn with_inputs(mut self, inputs: Vec<Artifact>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_resources(mut self, resources: ResourceSet) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_kind(mut self, kind: ActionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn test_info(&self) -> Option<&TestActionInfo> {
        match &self.kind {
            ActionKind::Test(info) => Some(info),
            _ => None,
        }
    }

    /// Hex SHA-256 over the command, environment, input digests, outputs and
    /// execution-info flags
    pub fn cache_key(&self, input_digests: &BTreeMap<PathBuf, Digest>) -> Result<String, String> {
        let inputs = CacheKeyInputs {
            mnemonic: &self.mnemonic,
            argv: &self.argv,
            env: &self.env,
            inputs: input_digests,
            outputs: &self.outputs,
            execution_info: &self.execution_info,
            kind: &self.kind,
        };
        Ok(Digest::of_canonical_json(&inputs)?.to_string())
    }
}

/// Committed value of an `ActionExecution` key
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub id: ActionId,
    pub mnemonic: String,
    pub owner: Label,
    pub output_digests: BTreeMap<PathBuf, Digest>,
    pub cacheable: bool,
    pub cache_key: String,
    pub test_result: Option<TestResultRecord>,
    /// Served from the action cache without running
    pub from_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> ActionGraphNode {
        ActionGraphNode::generic(
            "compile-a",
            "CppCompile",
            Label::parse_absolute("//pkg:a").unwrap(),
            vec!["cc".to_string(), "-c".to_string(), "a.cc".to_string()],
        )
        .with_inputs(vec![Artifact::source("pkg/a.cc")])
        .with_outputs(vec![PathBuf::from("bin/pkg/a.o")])
    }

    #[test]
    fn test_cache_key_tracks_input_digests() {
        let mut digests = BTreeMap::new();
        digests.insert(PathBuf::from("pkg/a.cc"), Digest::of_bytes(b"int a;"));
        let first = node().cache_key(&digests).unwrap();
        assert_eq!(first, node().cache_key(&digests).unwrap());
        assert_eq!(first.len(), 64);

        digests.insert(PathBuf::from("pkg/a.cc"), Digest::of_bytes(b"int b;"));
        assert_ne!(first, node().cache_key(&digests).unwrap());
    }

    #[test]
    fn test_cache_key_tracks_argv() {
        let digests = BTreeMap::new();
        let mut other = node();
        other.argv.push("-O2".to_string());
        assert_ne!(
            node().cache_key(&digests).unwrap(),
            other.cache_key(&digests).unwrap()
        );
    }

    #[test]
    fn test_cache_key_tracks_execution_info() {
        let digests = BTreeMap::new();
        let mut flagged = node();
        flagged
            .execution_info
            .insert("no-remote".to_string(), "1".to_string());
        assert_ne!(
            node().cache_key(&digests).unwrap(),
            flagged.cache_key(&digests).unwrap()
        );
    }
}
