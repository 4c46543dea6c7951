//! Effective configuration with provenance
//!
//! The merged JSON document is kept alongside the typed [`Settings`] view so
//! `keel config --json` can show exactly which layers contributed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::defaults::BuiltinDefaults;
use super::merge::merge_layers;

/// Schema identifier
pub const SCHEMA_ID: &str = "keel/effective_config@1";

/// Origin of a configuration source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    User,
    Workspace,
    Cli,
}

/// A contributing config source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// How test output reaches the terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestOutput {
    /// Output goes to the log files only
    Summary,
    /// Output is also forwarded line by line to the reporter
    Streamed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluatorSettings {
    pub workers: usize,
    pub check_determinism: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    pub jobs: usize,
    pub cpu: f64,
    pub memory_mb: f64,
    pub local_tests: f64,
    /// Mnemonic to strategy names, highest priority first
    pub strategies: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestSettings {
    pub keep_going: bool,
    pub output: TestOutput,
    pub setup_script: String,
    pub runfiles_prefix: String,
    pub timeout_seconds: u64,
    pub termination_grace_seconds: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceStatusSettings {
    pub stable: BTreeMap<String, String>,
}

/// Typed view of the merged configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub evaluator: EvaluatorSettings,
    pub execution: ExecutionSettings,
    pub test: TestSettings,
    #[serde(default)]
    pub workspace_status: WorkspaceStatusSettings,
}

impl Default for Settings {
    fn default() -> Self {
        let d = BuiltinDefaults::default();
        let mut strategies = BTreeMap::new();
        strategies.insert("TestRunner".to_string(), vec!["standalone".to_string()]);
        strategies.insert(
            "WorkspaceStatus".to_string(),
            vec!["workspace-status".to_string()],
        );
        Self {
            evaluator: EvaluatorSettings {
                workers: d.evaluator_workers,
                check_determinism: d.check_determinism,
            },
            execution: ExecutionSettings {
                jobs: d.execution_jobs,
                cpu: d.execution_cpu,
                memory_mb: d.execution_memory_mb,
                local_tests: d.local_tests,
                strategies,
            },
            test: TestSettings {
                keep_going: d.keep_going,
                output: TestOutput::Summary,
                setup_script: d.setup_script,
                runfiles_prefix: d.runfiles_prefix,
                timeout_seconds: d.test_timeout_seconds,
                termination_grace_seconds: d.termination_grace_seconds,
            },
            workspace_status: WorkspaceStatusSettings::default(),
        }
    }
}

impl Settings {
    /// Deserialize and validate a merged document
    pub fn from_value(value: &Value) -> Result<Self, ConfigError> {
        let settings: Settings = serde_json::from_value(value.clone())
            .map_err(|e| ConfigError::Parse(format!("invalid settings: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.evaluator.workers == 0 {
            return Err(ConfigError::Validation(
                "evaluator.workers must be at least 1".to_string(),
            ));
        }
        if self.execution.jobs == 0 {
            return Err(ConfigError::Validation(
                "execution.jobs must be at least 1".to_string(),
            ));
        }
        for (path, amount) in [
            ("execution.cpu", self.execution.cpu),
            ("execution.memory_mb", self.execution.memory_mb),
            ("execution.local_tests", self.execution.local_tests),
        ] {
            if amount.is_nan() || amount <= 0.0 {
                return Err(ConfigError::Validation(format!("{path} must be positive")));
            }
        }
        if self.test.timeout_seconds == 0 || self.test.timeout_seconds > 86_400 {
            return Err(ConfigError::Validation(
                "test.timeout_seconds must be in (0, 86400]".to_string(),
            ));
        }
        if let Some((mnemonic, _)) = self.execution.strategies.iter().find(|(_, v)| v.is_empty()) {
            return Err(ConfigError::Validation(format!(
                "execution.strategies.{mnemonic} must name at least one strategy"
            )));
        }
        Ok(())
    }
}

/// Effective configuration with provenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveConfig {
    pub schema_id: String,
    pub created_at: DateTime<Utc>,
    /// The merged configuration object
    pub config: Value,
    /// Contributing sources in precedence order
    pub sources: Vec<ConfigSource>,
    #[serde(skip)]
    pub settings: Settings,
}

impl EffectiveConfig {
    /// Build from the user file, the workspace file and CLI overrides.
    /// Missing files are skipped.
    pub fn build(
        user_config_path: Option<&Path>,
        workspace_config_path: Option<&Path>,
        cli_overrides: Option<Value>,
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![BuiltinDefaults::default().to_value()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        for (origin, path) in [
            (ConfigOrigin::User, user_config_path),
            (ConfigOrigin::Workspace, workspace_config_path),
        ] {
            let Some(path) = path.filter(|p| p.exists()) else {
                continue;
            };
            let (value, digest) = load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin,
                path: Some(path.to_path_buf()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let config = merge_layers(layers);
        let settings = Settings::from_value(&config)?;

        Ok(Self {
            schema_id: SCHEMA_ID.to_string(),
            created_at: Utc::now(),
            config,
            sources,
            settings,
        })
    }

    /// `~/.config/keel/config.toml`, when a home directory is known
    pub fn user_config_path() -> Option<PathBuf> {
        std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config/keel/config.toml"))
    }

    /// `<workspace>/.keel/config.toml`
    pub fn workspace_config_path(workspace_root: &Path) -> PathBuf {
        workspace_root.join(".keel").join("config.toml")
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Get a config value by dot-separated path
    pub fn get(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.config, |current, part| current.get(part))
    }
}

/// Read a TOML file, returning its JSON form and the digest of its bytes
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
    let digest = hex::encode(Sha256::digest(&bytes));

    let contents = String::from_utf8(bytes)
        .map_err(|e| ConfigError::Parse(format!("{}: invalid UTF-8: {e}", path.display())))?;
    let value: Value = toml::from_str(&contents)
        .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;

    Ok((value, digest))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
