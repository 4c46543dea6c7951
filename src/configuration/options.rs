//! Build options and configuration keys

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::packages::{Label, LabelError};

/// One `--test_env` entry: `NAME=value`, or `NAME` to inherit from the client
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestEnvEntry {
    pub name: String,
    pub value: Option<String>,
}

impl TestEnvEntry {
    pub fn parse(spec: &str) -> Self {
        match spec.split_once('=') {
            Some((name, value)) => Self {
                name: name.to_string(),
                value: Some(value.to_string()),
            },
            None => Self {
                name: spec.to_string(),
                value: None,
            },
        }
    }
}

/// The options that select a configuration
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Requested target CPU (before the CPU transformer is applied)
    pub cpu: String,
    /// Explicit compiler, when set
    pub compiler: Option<String>,
    /// Label of the toolchain suite; may be an alias
    pub crosstool_top: Label,
    /// `//pkg:file` label or workspace-relative path of the profile data
    pub fdo_optimize: Option<String>,
    /// Default shell environment handed to every action
    pub action_env: BTreeMap<String, String>,
    pub test_env: Vec<TestEnvEntry>,
}

impl BuildOptions {
    pub fn new(cpu: impl Into<String>, crosstool_top: &str) -> Result<Self, LabelError> {
        Ok(Self {
            cpu: cpu.into(),
            compiler: None,
            crosstool_top: Label::parse_absolute(crosstool_top)?,
            fdo_optimize: None,
            action_env: BTreeMap::new(),
            test_env: Vec::new(),
        })
    }

    pub fn with_compiler(mut self, compiler: impl Into<String>) -> Self {
        self.compiler = Some(compiler.into());
        self
    }

    pub fn with_fdo_optimize(mut self, fdo: impl Into<String>) -> Self {
        self.fdo_optimize = Some(fdo.into());
        self
    }

    pub fn with_test_env(mut self, spec: &str) -> Self {
        self.test_env.push(TestEnvEntry::parse(spec));
        self
    }
}

/// Which fragment of the configuration a key asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Cpp,
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FragmentKind::Cpp => write!(f, "cpp"),
        }
    }
}

/// Key payload for a configuration fragment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigurationKey {
    pub options: BuildOptions,
    pub fragment: FragmentKind,
}

impl ConfigurationKey {
    pub fn cpp(options: BuildOptions) -> Self {
        Self {
            options,
            fragment: FragmentKind::Cpp,
        }
    }
}
