//! Build configuration assembled from its fragments

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

use super::cpp::CppConfigurationParameters;
use super::options::{BuildOptions, ConfigurationKey};
use crate::collab::Digest;
use crate::graph::{EvalError, Environment, Key, Value, ValueProducer};
use crate::packages::Label;

/// Prefix of the precomputed keys carrying the client environment
pub const CLIENT_ENV_PREFIX: &str = "client_env:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CppConfiguration {
    pub toolchain_identifier: String,
    pub target_cpu: String,
    pub compiler: String,
    pub compiler_flags: Vec<String>,
    pub linker_flags: Vec<String>,
    pub fdo_zip: Option<PathBuf>,
    pub crosstool_top: Label,
    pub cc_toolchain_label: Label,
    pub cache_key_suffix: Option<String>,
}

impl CppConfiguration {
    pub fn new(params: &CppConfigurationParameters) -> Self {
        Self {
            toolchain_identifier: params.toolchain.identifier.clone(),
            target_cpu: params.toolchain.target_cpu.clone(),
            compiler: params.toolchain.compiler.clone(),
            compiler_flags: params.toolchain.compiler_flags.clone(),
            linker_flags: params.toolchain.linker_flags.clone(),
            fdo_zip: params.fdo_zip.clone(),
            crosstool_top: params.crosstool_top.clone(),
            cc_toolchain_label: params.cc_toolchain_label.clone(),
            cache_key_suffix: params.cache_key_suffix.as_ref().map(|d| d.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildConfiguration {
    pub cpp: CppConfiguration,
    /// Default shell environment of every action
    pub shell_env: BTreeMap<String, String>,
    /// `--test_env` after inheriting unset entries from the client
    pub test_env: BTreeMap<String, String>,
    /// Digest of everything above
    #[serde(skip)]
    pub checksum: String,
}

impl BuildConfiguration {
    pub fn new(
        cpp: CppConfiguration,
        shell_env: BTreeMap<String, String>,
        test_env: BTreeMap<String, String>,
    ) -> Result<Self, String> {
        let mut config = Self {
            cpp,
            shell_env,
            test_env,
            checksum: String::new(),
        };
        config.checksum = Digest::of_canonical_json(&config)?.to_string();
        Ok(config)
    }

    /// Short mnemonic used in output paths, e.g. `k8-gcc`
    pub fn mnemonic(&self) -> String {
        format!("{}-{}", self.cpp.target_cpu, self.cpp.compiler)
    }
}

pub struct BuildConfigurationProducer;

impl ValueProducer for BuildConfigurationProducer {
    fn produce(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, EvalError> {
        let Key::BuildConfiguration(options) = key else {
            return Err(EvalError::Internal(format!("configuration producer asked for {key}")));
        };
        let params = env.get(Key::ConfigurationFragment(ConfigurationKey::cpp(options.clone())))?;
        let cpp = CppConfiguration::new(params.as_cpp_parameters()?);
        let test_env = resolve_test_env(options, env)?;
        let config = BuildConfiguration::new(cpp, options.action_env.clone(), test_env)
            .map_err(|e| EvalError::Internal(format!("configuration checksum: {e}")))?;
        Ok(Value::Configuration(Arc::new(config)))
    }
}

/// Later entries win; `NAME` alone takes the client's value, if any
fn resolve_test_env(
    options: &BuildOptions,
    env: &mut Environment<'_>,
) -> Result<BTreeMap<String, String>, EvalError> {
    let inherited: Vec<Key> = options
        .test_env
        .iter()
        .filter(|entry| entry.value.is_none())
        .map(|entry| Key::precomputed(format!("{CLIENT_ENV_PREFIX}{}", entry.name)))
        .collect();
    let mut client = env.get_many(&inherited).into_iter();

    let mut resolved = BTreeMap::new();
    for entry in &options.test_env {
        let value = match &entry.value {
            Some(value) => Some(value.clone()),
            None => match client.next() {
                Some(value) => value?.as_text()?.clone(),
                None => None,
            },
        };
        match value {
            Some(value) => {
                resolved.insert(entry.name.clone(), value);
            }
            None => {
                resolved.remove(&entry.name);
            }
        }
    }
    Ok(resolved)
}
