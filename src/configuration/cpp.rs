//! C++ configuration fragment
//!
//! `ConfigurationFragmentProducer` resolves everything a C++ configuration
//! needs into an immutable [`CppConfigurationParameters`] bundle. Building
//! the configuration object from the bundle is a separate key so the
//! parameters stay cacheable on their own.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::options::{BuildOptions, ConfigurationKey};
use super::toolchain::Toolchain;
use crate::collab::{Digest, FileStore};
use crate::graph::{EvalError, Environment, InvalidConfiguration, Key, Value, ValueProducer};
use crate::packages::{Label, TargetLookup};

/// Prefix of the cc_toolchain rule name inside the crosstool top package
pub const CC_TOOLCHAIN_PREFIX: &str = "cc-compiler-";
pub const CC_TOOLCHAIN_RULE: &str = "cc_toolchain";

pub type CpuTransformer = Arc<dyn Fn(&str) -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq)]
pub struct CppConfigurationParameters {
    pub toolchain: Toolchain,
    /// Digest of the toolchain descriptor
    pub cache_key_suffix: Option<Digest>,
    pub options: BuildOptions,
    pub fdo_zip: Option<PathBuf>,
    pub exec_root: PathBuf,
    /// Crosstool top after following redirects
    pub crosstool_top: Label,
    pub cc_toolchain_label: Label,
}

pub struct ConfigurationFragmentProducer {
    cpu_transformer: CpuTransformer,
    workspace_root: PathBuf,
    exec_root: PathBuf,
    files: Arc<dyn FileStore>,
}

impl ConfigurationFragmentProducer {
    pub fn new(
        workspace_root: impl Into<PathBuf>,
        exec_root: impl Into<PathBuf>,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            cpu_transformer: Arc::new(|cpu: &str| cpu.to_string()),
            workspace_root: workspace_root.into(),
            exec_root: exec_root.into(),
            files,
        }
    }

    pub fn with_cpu_transformer(mut self, transformer: CpuTransformer) -> Self {
        self.cpu_transformer = transformer;
        self
    }

    fn target(env: &mut Environment<'_>, label: &Label) -> Result<TargetLookup, EvalError> {
        Ok(env.get(Key::Target(label.clone()))?.as_target()?.clone())
    }

    /// `//pkg:file` must name an existing input file; anything else is a
    /// workspace-relative path taken as is
    fn resolve_fdo(
        &self,
        env: &mut Environment<'_>,
        fdo: Option<&str>,
    ) -> Result<Option<PathBuf>, EvalError> {
        let Some(fdo) = fdo else {
            return Ok(None);
        };
        if !fdo.starts_with("//") {
            return Ok(Some(self.workspace_root.join(fdo)));
        }

        let label = Label::parse_absolute(fdo).map_err(|e| InvalidConfiguration::InvalidLabel {
            option: "--fdo_optimize",
            input: fdo.to_string(),
            message: e.to_string(),
        })?;
        let target = match Self::target(env, &label)? {
            TargetLookup::Found(target) => target,
            TargetLookup::NotFound { reason, .. } => {
                return Err(InvalidConfiguration::NoSuchTarget { message: reason }.into())
            }
        };
        if !target.is_input_file() {
            return Err(InvalidConfiguration::FdoNotInputFile.into());
        }
        let path = self.workspace_root.join(label.package_relative_path());
        if !self.files.exists(&path) {
            return Err(InvalidConfiguration::FdoFileMissing.into());
        }
        Ok(Some(path))
    }
}

impl ValueProducer for ConfigurationFragmentProducer {
    fn produce(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, EvalError> {
        let Key::ConfigurationFragment(ConfigurationKey { options, .. }) = key else {
            return Err(EvalError::Internal(format!("fragment producer asked for {key}")));
        };

        let crosstool_top = env
            .get(Key::Redirect(options.crosstool_top.clone()))?
            .as_label()?
            .clone();
        let descriptor = env.get(Key::ToolchainDescriptor(crosstool_top.clone()))?;
        let descriptor = descriptor.as_toolchains()?;
        let cpu = (self.cpu_transformer)(&options.cpu);
        let toolchain = descriptor.select(&cpu, options.compiler.as_deref())?.clone();
        debug!(cpu = %cpu, toolchain = %toolchain.identifier, "selected toolchain");

        let fdo_zip = self.resolve_fdo(env, options.fdo_optimize.as_deref())?;

        let cc_toolchain_label = crosstool_top
            .get_relative(&format!("{CC_TOOLCHAIN_PREFIX}{}", toolchain.target_cpu))
            .map_err(|_| InvalidConfiguration::InvalidCpu {
                cpu: toolchain.target_cpu.clone(),
            })?;
        match Self::target(env, &cc_toolchain_label)? {
            TargetLookup::NotFound { .. } => {
                return Err(InvalidConfiguration::ToolchainRuleMissing {
                    label: cc_toolchain_label,
                }
                .into())
            }
            TargetLookup::Found(target) if !target.is_rule_of(CC_TOOLCHAIN_RULE) => {
                return Err(InvalidConfiguration::NotCcToolchainRule {
                    label: cc_toolchain_label,
                }
                .into())
            }
            TargetLookup::Found(_) => {}
        }

        Ok(Value::CppParameters(Arc::new(CppConfigurationParameters {
            toolchain,
            cache_key_suffix: descriptor.digest.clone(),
            options: options.clone(),
            fdo_zip,
            exec_root: self.exec_root.clone(),
            crosstool_top,
            cc_toolchain_label,
        })))
    }
}
