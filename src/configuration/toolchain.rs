//! Toolchain descriptor (`CROSSTOOL.toml` in the crosstool top package)
//!
//! ```toml
//! [default_toolchains]
//! k8 = "local_linux"
//!
//! [[toolchain]]
//! identifier = "local_linux"
//! target_cpu = "k8"
//! compiler = "gcc"
//! compiler_flags = ["-Wall"]
//! ```

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::collab::{Digest, FileStore};
use crate::graph::{EvalError, Environment, InvalidConfiguration, Key, Value, ValueProducer};
use crate::packages::Label;

pub const DESCRIPTOR_FILE_NAME: &str = "CROSSTOOL.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toolchain {
    pub identifier: String,
    pub target_cpu: String,
    pub compiler: String,
    #[serde(default)]
    pub target_libc: Option<String>,
    #[serde(default)]
    pub compiler_flags: Vec<String>,
    #[serde(default)]
    pub linker_flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainFile {
    /// cpu → identifier of the default toolchain for that cpu
    #[serde(default)]
    pub default_toolchains: BTreeMap<String, String>,
    #[serde(rename = "toolchain", default)]
    pub toolchains: Vec<Toolchain>,
    /// Digest of the descriptor bytes
    #[serde(skip)]
    pub digest: Option<Digest>,
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("{path} not found")]
    Missing { path: PathBuf },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl ToolchainFile {
    pub fn parse(bytes: &[u8], path: &Path) -> Result<Self, DescriptorError> {
        let text = String::from_utf8_lossy(bytes);
        let mut file: ToolchainFile =
            toml::from_str(&text).map_err(|source| DescriptorError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        file.digest = Some(Digest::of_bytes(bytes));
        Ok(file)
    }

    /// Pick the toolchain for `cpu`: an exact cpu+compiler match when a
    /// compiler is given, else the cpu's default, else the first for the cpu.
    pub fn select(&self, cpu: &str, compiler: Option<&str>) -> Result<&Toolchain, InvalidConfiguration> {
        let for_cpu = || self.toolchains.iter().filter(move |t| t.target_cpu == cpu);
        let selected = match compiler {
            Some(compiler) => for_cpu().find(|t| t.compiler == compiler),
            None => self
                .default_toolchains
                .get(cpu)
                .and_then(|id| for_cpu().find(|t| &t.identifier == id))
                .or_else(|| for_cpu().next()),
        };
        selected.ok_or_else(|| InvalidConfiguration::NoMatchingToolchain {
            cpu: cpu.to_string(),
            compiler: compiler.map(str::to_string),
        })
    }
}

/// Loads the descriptor of a crosstool top
pub trait ToolchainLoader: Send + Sync {
    fn load(&self, crosstool_top: &Label) -> Result<ToolchainFile, DescriptorError>;
}

/// Reads `<workspace>/<crosstool package>/CROSSTOOL.toml`
pub struct LocalToolchainLoader {
    workspace_root: PathBuf,
    files: Arc<dyn FileStore>,
}

impl LocalToolchainLoader {
    pub fn new(workspace_root: impl Into<PathBuf>, files: Arc<dyn FileStore>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            files,
        }
    }

    pub fn descriptor_path(&self, crosstool_top: &Label) -> PathBuf {
        self.workspace_root
            .join(crosstool_top.package())
            .join(DESCRIPTOR_FILE_NAME)
    }
}

impl ToolchainLoader for LocalToolchainLoader {
    fn load(&self, crosstool_top: &Label) -> Result<ToolchainFile, DescriptorError> {
        let path = self.descriptor_path(crosstool_top);
        if !self.files.exists(&path) {
            return Err(DescriptorError::Missing { path });
        }
        let bytes = self.files.read_bytes(&path).map_err(|source| DescriptorError::Io {
            path: path.clone(),
            source,
        })?;
        ToolchainFile::parse(&bytes, &path)
    }
}

pub struct ToolchainDescriptorProducer {
    loader: Arc<dyn ToolchainLoader>,
}

impl ToolchainDescriptorProducer {
    pub fn new(loader: Arc<dyn ToolchainLoader>) -> Self {
        Self { loader }
    }
}

impl ValueProducer for ToolchainDescriptorProducer {
    fn produce(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, EvalError> {
        let Key::ToolchainDescriptor(label) = key else {
            return Err(EvalError::Internal(format!("descriptor producer asked for {key}")));
        };
        // the descriptor lives next to the crosstool top's build file
        env.get(Key::AstFileLookup(crate::packages::build_file_path(label)))?;
        let file = self.loader.load(label).map_err(|e| {
            EvalError::from(InvalidConfiguration::DescriptorUnavailable {
                label: label.clone(),
                message: e.to_string(),
            })
        })?;
        Ok(Value::Toolchains(Arc::new(file)))
    }
}
