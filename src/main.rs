//! Keel CLI
//!
//! Entry point for the `keel` command-line tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use keel::build::MANIFEST_FILE_NAME;
use keel::collab::{Event, EventReporter, TracingReporter};
use keel::config::EffectiveConfig;
use keel::signal::{self, InterruptState};
use keel::{Build, ExitCode, Manifest};
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "keel")]
#[command(about = "Incremental build and test runner", version)]
struct Cli {
    /// Log debug output (overrides KEEL_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Workspace root (default: current directory)
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run the tests declared in the manifest
    Test {
        /// Path to the manifest (default: <workspace>/keel.toml)
        #[arg(long, short = 'm')]
        manifest: Option<PathBuf>,

        /// Keep running tests after one did not pass
        #[arg(long)]
        keep_going: bool,

        /// Number of executor threads
        #[arg(long, short = 'j')]
        jobs: Option<usize>,

        /// Number of evaluator workers
        #[arg(long)]
        workers: Option<usize>,

        /// Test output mode
        #[arg(long, value_parser = ["summary", "streamed"])]
        test_output: Option<String>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the effective configuration
    Config {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

/// Prints streamed test output, everything else goes to the log
struct ConsoleReporter;

impl EventReporter for ConsoleReporter {
    fn post(&self, event: Event) {
        match event {
            Event::Output { target, line, .. } => println!("[{target}] {line}"),
            other => TracingReporter.post(other),
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let workspace = match cli.workspace.clone() {
        Some(path) => path,
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("Cannot determine the current directory: {}", e);
                process::exit(ExitCode::Environmental.as_i32());
            }
        },
    };

    match cli.command {
        Commands::Test {
            manifest,
            keep_going,
            jobs,
            workers,
            test_output,
            json,
        } => {
            let overrides = cli_overrides(keep_going, jobs, workers, test_output);
            run_test(&workspace, manifest, overrides, json);
        }
        Commands::Config { json } => run_config(&workspace, json),
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("KEEL_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// CLI flags as the top configuration layer
fn cli_overrides(
    keep_going: bool,
    jobs: Option<usize>,
    workers: Option<usize>,
    test_output: Option<String>,
) -> Option<Value> {
    let mut root = Map::new();
    let mut test = Map::new();
    if keep_going {
        test.insert("keep_going".to_string(), json!(true));
    }
    if let Some(output) = test_output {
        test.insert("output".to_string(), json!(output));
    }
    if !test.is_empty() {
        root.insert("test".to_string(), Value::Object(test));
    }
    if let Some(jobs) = jobs {
        root.insert("execution".to_string(), json!({ "jobs": jobs }));
    }
    if let Some(workers) = workers {
        root.insert("evaluator".to_string(), json!({ "workers": workers }));
    }
    (!root.is_empty()).then_some(Value::Object(root))
}

fn load_config(workspace: &Path, overrides: Option<Value>) -> EffectiveConfig {
    let user = EffectiveConfig::user_config_path();
    let project = EffectiveConfig::workspace_config_path(workspace);
    match EffectiveConfig::build(user.as_deref(), Some(&project), overrides) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            process::exit(ExitCode::Usage.as_i32());
        }
    }
}

fn run_config(workspace: &Path, json: bool) {
    let config = load_config(workspace, None);
    if json {
        match config.to_json() {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error serializing output: {}", e);
                process::exit(ExitCode::Internal.as_i32());
            }
        }
        return;
    }
    for source in &config.sources {
        match &source.path {
            Some(path) => println!("# {:?}: {}", source.origin, path.display()),
            None => println!("# {:?}", source.origin),
        }
    }
    match toml::to_string_pretty(&config.config) {
        Ok(text) => print!("{}", text),
        Err(e) => {
            eprintln!("Error serializing output: {}", e);
            process::exit(ExitCode::Internal.as_i32());
        }
    }
}

fn run_test(workspace: &Path, manifest: Option<PathBuf>, overrides: Option<Value>, json: bool) {
    let config = load_config(workspace, overrides);
    let manifest_path = manifest.unwrap_or_else(|| workspace.join(MANIFEST_FILE_NAME));
    let manifest = match Manifest::load(&manifest_path) {
        Ok(manifest) => manifest,
        Err(e) => {
            eprintln!("{}", e);
            process::exit(e.exit_code().as_i32());
        }
    };

    let interrupt = Arc::new(InterruptState::new());
    if let Err(e) = signal::install(Arc::clone(&interrupt)) {
        eprintln!("Failed to install signal handler: {}", e);
        process::exit(ExitCode::Environmental.as_i32());
    }

    let client_env: BTreeMap<String, String> = std::env::vars().collect();
    let build = Build::new(workspace, manifest, config.settings)
        .with_client_env(client_env)
        .with_interrupt(interrupt.flag())
        .with_reporter(Arc::new(ConsoleReporter));

    match build.run() {
        Ok(outcome) => {
            if json {
                match outcome.summary.to_json() {
                    Ok(text) => println!("{}", text),
                    Err(e) => {
                        eprintln!("Error serializing output: {}", e);
                        process::exit(ExitCode::Internal.as_i32());
                    }
                }
            } else {
                print!("{}", outcome.summary.render());
            }
            process::exit(outcome.exit_code.as_i32());
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            process::exit(e.exit_code().as_i32());
        }
    }
}
