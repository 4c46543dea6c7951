//! One `keel test` invocation
//!
//! The driver reads the workspace manifest and resolves the build
//! configuration. It then assembles the action graph and evaluates every test
//! action through the graph. Configuration and execution use one store, so
//! the execution phase reuses the configuration values already computed.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use keel_exec::LocalCommandRunner;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::action::{
    workspace_status_action, ActionCache, ActionExecutionProducer, ActionGraph, ActionGraphError,
    ActionGraphNode, ActionKind, Artifact, EngineConfig, EngineError, ExecutionContext,
    ExecutionEngine, FileStateProducer, LocalStrategy, ResourceSet, StrategyRegistry,
    TestActionInfo, WorkspaceStatusStrategy,
};
use crate::collab::{CollectingReporter, EventReporter, FanoutReporter, FileStore, LocalFileStore};
use crate::config::{ConfigError, Settings};
use crate::configuration::{
    BuildConfiguration, BuildConfigurationProducer, BuildOptions, ConfigurationFragmentProducer,
    LocalToolchainLoader, ToolchainDescriptorProducer, CLIENT_ENV_PREFIX,
};
use crate::graph::{
    EvalError, EvaluationResult, Evaluator, EvaluatorOptions, Key, KeyKind, KeyedValueStore,
    PrecomputedProducer, PrecomputedTable, ProducerRegistry,
};
use crate::packages::{
    AstFileLookupProducer, Label, LabelError, LocalBuildFileParser, RedirectProducer,
    StaticPackageResolver, Target, TargetProducer,
};
use crate::summary::{BuildSummary, ExitCode, FailureKind, SummaryBuilder};
use crate::test_strategy::{StandaloneTestStrategy, TEST_MNEMONIC};

/// Default manifest name at the workspace root
pub const MANIFEST_FILE_NAME: &str = "keel.toml";

/// Everything the driver writes lives below this exec-root relative directory
pub const OUTPUT_DIR: &str = "keel-out";

pub const BUILD_ID_KEY: &str = "build_id";

const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("failed to read manifest {}: {source}", .path.display())]
    ManifestIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid manifest {}: {message}", .path.display())]
    Manifest { path: PathBuf, message: String },

    #[error(transparent)]
    Label(#[from] LabelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    ActionGraph(#[from] ActionGraphError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("failed to write build summary: {0}")]
    Summary(std::io::Error),
}

impl BuildError {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            BuildError::ManifestIo { .. }
            | BuildError::Manifest { .. }
            | BuildError::Label(_)
            | BuildError::Config(_) => ExitCode::Usage,
            BuildError::ActionGraph(_) | BuildError::Engine(EngineError::NoStrategy { .. }) => {
                ExitCode::BuildFailed
            }
            BuildError::Engine(EngineError::Aborted { .. }) => ExitCode::TestsFailed,
            BuildError::Engine(EngineError::Interrupted) => ExitCode::Interrupted,
            BuildError::Engine(EngineError::Internal(_)) => ExitCode::Internal,
            BuildError::Summary(_) => ExitCode::Environmental,
        }
    }
}

/// `[options]` table of the manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestOptions {
    pub cpu: String,
    #[serde(default)]
    pub compiler: Option<String>,
    pub crosstool_top: String,
    #[serde(default)]
    pub fdo_optimize: Option<String>,
    #[serde(default)]
    pub action_env: BTreeMap<String, String>,
    /// `NAME=value` or `NAME`
    #[serde(default)]
    pub test_env: Vec<String>,
}

/// `[[test]]` entry of the manifest
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestTarget {
    pub label: Label,
    /// Workspace-relative test binary or script
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Extra workspace-relative inputs; a change to one reruns the test
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
}

/// Workspace manifest (`keel.toml`)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub options: ManifestOptions,
    /// Targets known to the package resolver
    #[serde(default, rename = "target")]
    pub targets: Vec<Target>,
    #[serde(default, rename = "test")]
    pub tests: Vec<TestTarget>,
}

impl Manifest {
    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let text = fs::read_to_string(path).map_err(|source| BuildError::ManifestIo {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    pub fn parse(text: &str, path: &Path) -> Result<Self, BuildError> {
        let manifest: Manifest = toml::from_str(text).map_err(|e| BuildError::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = manifest.tests.iter().find(|t| !seen.insert(&t.label)) {
            return Err(BuildError::Manifest {
                path: path.to_path_buf(),
                message: format!("test '{}' is declared twice", dup.label),
            });
        }
        Ok(manifest)
    }

    /// Build options for this invocation. `PATH` is taken from the client
    /// when the manifest does not set it, since actions run with a cleared
    /// environment.
    pub fn build_options(
        &self,
        client_env: &BTreeMap<String, String>,
    ) -> Result<BuildOptions, BuildError> {
        let mut options = BuildOptions::new(&self.options.cpu, &self.options.crosstool_top)?;
        if let Some(compiler) = &self.options.compiler {
            options = options.with_compiler(compiler);
        }
        if let Some(fdo) = &self.options.fdo_optimize {
            options = options.with_fdo_optimize(fdo);
        }
        options.action_env = self.options.action_env.clone();
        options.action_env.entry("PATH".to_string()).or_insert_with(|| {
            client_env
                .get("PATH")
                .cloned()
                .unwrap_or_else(|| DEFAULT_PATH.to_string())
        });
        for spec in &self.options.test_env {
            options = options.with_test_env(spec);
        }
        Ok(options)
    }

    pub fn resolver(&self) -> StaticPackageResolver {
        let mut resolver = StaticPackageResolver::new();
        for target in &self.targets {
            resolver.add_target(target.clone());
        }
        resolver
    }
}

/// Result of a finished invocation
#[derive(Debug)]
pub struct BuildOutcome {
    pub summary: BuildSummary,
    pub exit_code: ExitCode,
}

pub struct Build {
    workspace_root: PathBuf,
    manifest: Manifest,
    settings: Settings,
    client_env: BTreeMap<String, String>,
    interrupt: Arc<AtomicBool>,
    reporter: Arc<dyn EventReporter>,
    cache: Arc<ActionCache>,
}

impl Build {
    pub fn new(workspace_root: impl Into<PathBuf>, manifest: Manifest, settings: Settings) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            manifest,
            settings,
            client_env: BTreeMap::new(),
            interrupt: Arc::new(AtomicBool::new(false)),
            reporter: Arc::new(crate::collab::TracingReporter),
            cache: Arc::new(ActionCache::new()),
        }
    }

    /// Variables a `--test_env NAME` entry may inherit
    pub fn with_client_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.client_env = env;
        self
    }

    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn EventReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Share an action cache between invocations in one process
    pub fn with_action_cache(mut self, cache: Arc<ActionCache>) -> Self {
        self.cache = cache;
        self
    }

    fn output_dir(&self) -> PathBuf {
        PathBuf::from(OUTPUT_DIR)
    }

    fn evaluator_options(&self) -> EvaluatorOptions {
        EvaluatorOptions {
            workers: self.settings.evaluator.workers,
            check_determinism: self.settings.evaluator.check_determinism,
        }
    }

    /// Producers that only read the workspace
    fn configuration_registry(
        &self,
        precomputed: &PrecomputedTable,
        files: &Arc<dyn FileStore>,
    ) -> ProducerRegistry {
        let resolver = Arc::new(self.manifest.resolver());
        let parser = Arc::new(LocalBuildFileParser::new(&self.workspace_root, Arc::clone(files)));
        let loader = Arc::new(LocalToolchainLoader::new(&self.workspace_root, Arc::clone(files)));

        let mut registry = ProducerRegistry::new();
        registry
            .register(KeyKind::Precomputed, PrecomputedProducer::new(precomputed.clone()))
            .register(KeyKind::AstFileLookup, AstFileLookupProducer::new(parser))
            .register(KeyKind::Target, TargetProducer::new(resolver.clone()))
            .register(KeyKind::Redirect, RedirectProducer::new(resolver))
            .register(KeyKind::ToolchainDescriptor, ToolchainDescriptorProducer::new(loader))
            .register(
                KeyKind::ConfigurationFragment,
                ConfigurationFragmentProducer::new(
                    &self.workspace_root,
                    &self.workspace_root,
                    Arc::clone(files),
                ),
            )
            .register(KeyKind::BuildConfiguration, BuildConfigurationProducer)
            .register(
                KeyKind::FileState,
                FileStateProducer::new(&self.workspace_root, Arc::clone(files)),
            );
        registry
    }

    fn test_action(&self, test: &TestTarget, config: &BuildConfiguration) -> ActionGraphNode {
        let out = self.output_dir();
        let package_dir = out.join(config.mnemonic());
        let target_dir = Path::new(test.label.package()).join(test.label.name());
        let info = TestActionInfo {
            target: test.label.clone(),
            executable: test.executable.clone(),
            args: test.args.clone(),
            timeout_seconds: test
                .timeout_seconds
                .unwrap_or(self.settings.test.timeout_seconds),
            runfiles_dir: package_dir
                .join("bin")
                .join(format!("{}.runfiles", target_dir.display())),
            log_dir: package_dir.join("testlogs").join(&target_dir),
            shell_env: config.shell_env.clone(),
            test_env: config.test_env.clone(),
        };

        let mut inputs = vec![
            Artifact::source(&self.settings.test.setup_script),
            Artifact::source(&test.executable),
        ];
        inputs.extend(test.inputs.iter().map(Artifact::source));
        let mut argv = vec![test.executable.display().to_string()];
        argv.extend(test.args.iter().cloned());

        ActionGraphNode::generic(
            format!("test {}", test.label),
            TEST_MNEMONIC,
            test.label.clone(),
            argv,
        )
        .with_inputs(inputs)
        .with_outputs(vec![info.log_path(), info.result_path()])
        .with_resources(ResourceSet::new(1.0, 250.0, 1.0))
        .with_env(config.shell_env.clone())
        .with_kind(ActionKind::Test(Box::new(info)))
    }

    fn action_graph(&self, config: &BuildConfiguration) -> Result<ActionGraph, BuildError> {
        let mut graph = ActionGraph::new();
        let owner = Label::parse_absolute("//:workspace_status")?;
        graph.add(workspace_status_action(owner, &self.output_dir().join("build-data")))?;
        for test in &self.manifest.tests {
            graph.add(self.test_action(test, config))?;
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Run the build. Evaluation failures end up in the summary; only
    /// failures to set the build up are returned as errors.
    pub fn run(&self) -> Result<BuildOutcome, BuildError> {
        let started_at = Utc::now();
        let build_id = ulid::Ulid::new().to_string();
        info!(%build_id, tests = self.manifest.tests.len(), "starting build");

        let files: Arc<dyn FileStore> = Arc::new(LocalFileStore);
        let precomputed = PrecomputedTable::new();
        precomputed.set(BUILD_ID_KEY, build_id.clone());
        for (name, value) in &self.client_env {
            precomputed.set(format!("{CLIENT_ENV_PREFIX}{name}"), value.clone());
        }

        let collector = Arc::new(CollectingReporter::new());
        let collecting: Arc<dyn EventReporter> = collector.clone();
        let reporter: Arc<dyn EventReporter> = Arc::new(FanoutReporter::new(vec![
            collecting,
            Arc::clone(&self.reporter),
        ]));

        let store = Arc::new(KeyedValueStore::new());
        let mut summary = SummaryBuilder::new();

        // configuration
        let options = self.manifest.build_options(&self.client_env)?;
        let config_key = Key::BuildConfiguration(options);
        let registry = self.configuration_registry(&precomputed, &files);
        let evaluator = Evaluator::new(Arc::clone(&store), registry.clone(), self.evaluator_options())
            .with_interrupt(Arc::clone(&self.interrupt));
        let result = evaluator.evaluate(std::slice::from_ref(&config_key));
        let config = match configuration(&result, &config_key) {
            Ok(config) => config,
            Err(err) => {
                warn!(error = %err, "configuration failed");
                summary.add_failure(&err);
                if FailureKind::of(&err).exit_code() == ExitCode::BuildFailed {
                    summary.add_exit_code(ExitCode::Usage);
                }
                return self.finish(summary, &build_id, started_at);
            }
        };
        debug!(configuration = %config.mnemonic(), checksum = %config.checksum, "configuration resolved");

        // execution
        let graph = Arc::new(self.action_graph(&config)?);
        let mut strategies = StrategyRegistry::new();
        strategies
            .register(LocalStrategy)
            .register(StandaloneTestStrategy::new((&self.settings.test).into()))
            .register(WorkspaceStatusStrategy::new(
                self.settings.workspace_status.stable.clone(),
                build_id.clone(),
            ));
        let execution = &self.settings.execution;
        let engine = Arc::new(ExecutionEngine::start(
            EngineConfig {
                jobs: execution.jobs,
                budget: ResourceSet::new(execution.cpu, execution.memory_mb, execution.local_tests),
                strategies: execution.strategies.clone(),
            },
            strategies,
            ExecutionContext {
                exec_root: self.workspace_root.clone(),
                runner: Arc::new(LocalCommandRunner::new(Duration::from_secs(
                    self.settings.test.termination_grace_seconds,
                ))),
                files: Arc::clone(&files),
                reporter,
                cancel: Arc::clone(&self.interrupt),
            },
        )?);
        engine.plan(&graph)?;

        let mut registry = registry;
        registry.register(
            KeyKind::ActionExecution,
            ActionExecutionProducer::new(
                Arc::clone(&graph),
                Arc::clone(&engine),
                Arc::clone(&self.cache),
                Arc::clone(&files),
                &self.workspace_root,
            ),
        );
        let evaluator = Evaluator::new(Arc::clone(&store), registry, self.evaluator_options())
            .with_interrupt(Arc::clone(&self.interrupt));
        let roots: Vec<Key> = graph
            .nodes()
            .map(|node| Key::ActionExecution(node.id.clone()))
            .collect();
        let result = evaluator.evaluate(&roots);

        let executed = collector.test_results();
        for record in &executed {
            summary.add_test(record, false);
        }
        for (key, value) in result.iter() {
            match value {
                Ok(value) => {
                    if let Ok(outcome) = value.as_action() {
                        if let (true, Some(record)) = (outcome.from_cache, &outcome.test_result) {
                            summary.add_test(record, true);
                        }
                    }
                }
                Err(err) => {
                    let reported = matches!(
                        err.root_cause(),
                        EvalError::ActionFailed { owner, .. }
                            if executed.iter().any(|r| r.target == owner.to_string())
                    );
                    if !reported {
                        debug!(%key, error = %err, "action failed");
                        summary.add_failure(err);
                    }
                }
            }
        }
        if let Some(halt) = result.halted() {
            summary.add_failure(halt);
        }
        self.finish(summary, &build_id, started_at)
    }

    fn finish(
        &self,
        summary: SummaryBuilder,
        build_id: &str,
        started_at: chrono::DateTime<Utc>,
    ) -> Result<BuildOutcome, BuildError> {
        let exit_code = summary.exit_code();
        let summary = summary.finish(build_id, started_at);
        summary
            .write_to_file(
                &self
                    .workspace_root
                    .join(self.output_dir())
                    .join("build_summary.json"),
            )
            .map_err(BuildError::Summary)?;
        info!(exit_code = exit_code.as_i32(), "build finished");
        Ok(BuildOutcome { summary, exit_code })
    }
}

fn configuration(
    result: &EvaluationResult,
    key: &Key,
) -> Result<Arc<BuildConfiguration>, EvalError> {
    if let Some(halt) = result.halted() {
        return Err(halt.clone());
    }
    match result.get(key) {
        Some(Ok(value)) => Ok(Arc::clone(value.as_configuration()?)),
        Some(Err(err)) => Err(err.clone()),
        None => Err(EvalError::Internal(format!("no value for {key}"))),
    }
}
