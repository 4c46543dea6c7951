//! Build file lookup and the target/redirect producers
//!
//! Build files are not parsed; the lookup records the file's digest so a
//! change to a package's build file invalidates every target looked up in
//! that package.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::target::{build_file_path, PackageResolver};
use crate::collab::{Digest, FileStore};
use crate::graph::{EvalError, Environment, InvalidConfiguration, Key, Value, ValueProducer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFileAst {
    pub path: PathBuf,
    pub digest: Digest,
}

/// A build file, or its absence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AstFileLookupValue(pub Option<Arc<BuildFileAst>>);

impl AstFileLookupValue {
    pub const NO_FILE: AstFileLookupValue = AstFileLookupValue(None);

    pub fn ast(&self) -> Option<&BuildFileAst> {
        self.0.as_deref()
    }

    pub fn exists(&self) -> bool {
        self.0.is_some()
    }
}

pub trait BuildFileParser: Send + Sync {
    /// `Ok(None)` when the file does not exist
    fn parse(&self, path: &Path) -> io::Result<Option<BuildFileAst>>;
}

/// Reads build files below a workspace root
pub struct LocalBuildFileParser {
    workspace_root: PathBuf,
    files: Arc<dyn FileStore>,
}

impl LocalBuildFileParser {
    pub fn new(workspace_root: impl Into<PathBuf>, files: Arc<dyn FileStore>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            files,
        }
    }
}

impl BuildFileParser for LocalBuildFileParser {
    fn parse(&self, path: &Path) -> io::Result<Option<BuildFileAst>> {
        let absolute = self.workspace_root.join(path);
        if !self.files.exists(&absolute) {
            return Ok(None);
        }
        let bytes = self.files.read_bytes(&absolute)?;
        Ok(Some(BuildFileAst {
            path: path.to_path_buf(),
            digest: Digest::of_bytes(&bytes),
        }))
    }
}

pub struct AstFileLookupProducer {
    parser: Arc<dyn BuildFileParser>,
}

impl AstFileLookupProducer {
    pub fn new(parser: Arc<dyn BuildFileParser>) -> Self {
        Self { parser }
    }
}

impl ValueProducer for AstFileLookupProducer {
    fn produce(&self, key: &Key, _env: &mut Environment<'_>) -> Result<Value, EvalError> {
        let Key::AstFileLookup(path) = key else {
            return Err(EvalError::Internal(format!("ast lookup asked for {key}")));
        };
        match self.parser.parse(path) {
            Ok(Some(ast)) => Ok(Value::AstFile(AstFileLookupValue(Some(Arc::new(ast))))),
            Ok(None) => Ok(Value::AstFile(AstFileLookupValue::NO_FILE)),
            Err(e) => Err(EvalError::Environmental(format!(
                "failed to read build file {}: {e}",
                path.display()
            ))),
        }
    }
}

pub struct TargetProducer {
    resolver: Arc<dyn PackageResolver>,
}

impl TargetProducer {
    pub fn new(resolver: Arc<dyn PackageResolver>) -> Self {
        Self { resolver }
    }
}

impl ValueProducer for TargetProducer {
    fn produce(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, EvalError> {
        let Key::Target(label) = key else {
            return Err(EvalError::Internal(format!("target producer asked for {key}")));
        };
        let build_file = env.get(Key::AstFileLookup(build_file_path(label)))?;
        if !build_file.as_ast_file()?.exists() {
            debug!(package = label.package(), "package has no build file on disk");
        }
        let lookup = self.resolver.resolve_label(label).map_err(|e| {
            EvalError::from(InvalidConfiguration::NoSuchTarget {
                message: e.to_string(),
            })
        })?;
        Ok(Value::Target(lookup))
    }
}

/// Follows aliases of the crosstool top
pub struct RedirectProducer {
    resolver: Arc<dyn PackageResolver>,
}

impl RedirectProducer {
    pub fn new(resolver: Arc<dyn PackageResolver>) -> Self {
        Self { resolver }
    }
}

impl ValueProducer for RedirectProducer {
    fn produce(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, EvalError> {
        let Key::Redirect(label) = key else {
            return Err(EvalError::Internal(format!("redirect producer asked for {key}")));
        };
        env.get(Key::AstFileLookup(build_file_path(label)))?;
        let resolved = self.resolver.follow_redirects(label).map_err(|e| {
            EvalError::from(InvalidConfiguration::Redirect {
                option: "--crosstool_top",
                label: label.clone(),
                message: e.to_string(),
            })
        })?;
        Ok(Value::Label(resolved))
    }
}
