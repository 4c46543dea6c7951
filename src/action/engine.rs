//! Budgeted execution engine
//!
//! A fixed set of executor threads pulls submitted nodes from a FIFO queue.
//! A node is admitted when its resource estimate fits the budget that is
//! currently free (first fit); the budget it holds is returned by a lease
//! when the strategy finishes, which wakes the queue again.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::graph::ActionGraph;
use super::node::{ActionGraphNode, ActionId};
use super::resources::ResourceSet;
use super::strategy::{
    ActionReport, ExecutionContext, ExecutionStrategy, StrategyError, StrategyRegistry,
};
use crate::packages::Label;

pub const DEFAULT_STRATEGY: &str = "local";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("no execution strategy for {mnemonic} action '{action}' (tried: {})", .tried.join(", "))]
    NoStrategy {
        mnemonic: String,
        action: ActionId,
        tried: Vec<String>,
    },

    #[error("build aborted after test {target} did not pass")]
    Aborted { target: Label },

    #[error("execution interrupted")]
    Interrupted,

    #[error("internal engine error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Executor threads
    pub jobs: usize,
    pub budget: ResourceSet,
    /// mnemonic → strategy names in priority order
    pub strategies: BTreeMap<String, Vec<String>>,
}

impl EngineConfig {
    pub fn priority(&self, mnemonic: &str) -> Vec<String> {
        self.strategies
            .get(mnemonic)
            .cloned()
            .unwrap_or_else(|| vec![DEFAULT_STRATEGY.to_string()])
    }
}

type Reply = Result<ActionReport, EngineError>;

struct Job {
    node: Arc<ActionGraphNode>,
    strategy: Arc<dyn ExecutionStrategy>,
    estimate: ResourceSet,
    reply: Sender<Reply>,
}

struct EngineState {
    queue: VecDeque<Job>,
    available: ResourceSet,
    running: usize,
    shutdown: bool,
    aborted: Option<Label>,
}

struct Shared {
    state: Mutex<EngineState>,
    changed: Condvar,
    budget: ResourceSet,
    context: ExecutionContext,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Budget held by a running job
struct Lease<'a> {
    shared: &'a Shared,
    amount: ResourceSet,
}

impl Drop for Lease<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.running -= 1;
        // an idle engine holds exactly the configured budget
        state.available = if state.running == 0 {
            self.shared.budget
        } else {
            state.available.add(&self.amount).clamp_to(&self.shared.budget)
        };
        self.shared.changed.notify_all();
    }
}

/// Completion handle of a submitted node
pub struct PendingExecution {
    rx: Receiver<Reply>,
}

impl PendingExecution {
    pub fn wait(self) -> Result<ActionReport, EngineError> {
        self.rx
            .recv()
            .unwrap_or_else(|_| Err(EngineError::Internal("executor dropped the job".to_string())))
    }
}

pub struct ExecutionEngine {
    shared: Arc<Shared>,
    config: EngineConfig,
    registry: StrategyRegistry,
    planned: RwLock<HashMap<ActionId, Arc<dyn ExecutionStrategy>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl ExecutionEngine {
    pub fn start(
        config: EngineConfig,
        registry: StrategyRegistry,
        context: ExecutionContext,
    ) -> Result<Self, EngineError> {
        let shared = Arc::new(Shared {
            state: Mutex::new(EngineState {
                queue: VecDeque::new(),
                available: config.budget,
                running: 0,
                shutdown: false,
                aborted: None,
            }),
            changed: Condvar::new(),
            budget: config.budget,
            context,
        });
        let engine = Self {
            shared,
            config,
            registry,
            planned: RwLock::new(HashMap::new()),
            threads: Mutex::new(Vec::new()),
        };

        for index in 0..engine.config.jobs.max(1) {
            let shared = Arc::clone(&engine.shared);
            let handle = thread::Builder::new()
                .name(format!("keel-exec-{index}"))
                .spawn(move || executor_loop(&shared))
                .map_err(|e| EngineError::Internal(format!("failed to spawn executor: {e}")))?;
            engine
                .threads
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(handle);
        }
        debug!(jobs = engine.config.jobs, budget = ?engine.config.budget, "execution engine started");
        Ok(engine)
    }

    /// Pick a strategy for every node of `graph` before anything runs
    pub fn plan(&self, graph: &ActionGraph) -> Result<(), EngineError> {
        let mut by_mnemonic: HashMap<&str, Vec<String>> = HashMap::new();
        let mut planned = HashMap::new();
        for node in graph.nodes() {
            let priority = by_mnemonic
                .entry(node.mnemonic.as_str())
                .or_insert_with(|| self.config.priority(&node.mnemonic));
            let strategy = self.registry.resolve(node, priority).ok_or_else(|| {
                EngineError::NoStrategy {
                    mnemonic: node.mnemonic.clone(),
                    action: node.id.clone(),
                    tried: priority.clone(),
                }
            })?;
            debug!(action = %node.id, strategy = strategy.name(), "planned");
            planned.insert(node.id.clone(), strategy);
        }
        self.planned
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(planned);
        Ok(())
    }

    fn strategy_for(
        &self,
        node: &ActionGraphNode,
    ) -> Result<Arc<dyn ExecutionStrategy>, EngineError> {
        if let Some(strategy) = self
            .planned
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&node.id)
        {
            return Ok(Arc::clone(strategy));
        }
        let priority = self.config.priority(&node.mnemonic);
        self.registry
            .resolve(node, &priority)
            .ok_or_else(|| EngineError::NoStrategy {
                mnemonic: node.mnemonic.clone(),
                action: node.id.clone(),
                tried: priority,
            })
    }

    /// Queue `node` for execution. Fails at once after an abort.
    pub fn submit(&self, node: Arc<ActionGraphNode>) -> Result<PendingExecution, EngineError> {
        let strategy = self.strategy_for(&node)?;
        let estimate = node.resources.clamp_to(&self.shared.budget);
        let (reply, rx) = mpsc::channel();

        let mut state = self.shared.lock();
        if let Some(target) = &state.aborted {
            return Err(EngineError::Aborted {
                target: target.clone(),
            });
        }
        debug!(action = %node.id, strategy = strategy.name(), ?estimate, "queued");
        state.queue.push_back(Job {
            node,
            strategy,
            estimate,
            reply,
        });
        self.shared.changed.notify_all();
        Ok(PendingExecution { rx })
    }

    pub fn aborted(&self) -> Option<Label> {
        self.shared.lock().aborted.clone()
    }

    /// Budget not held by running jobs
    pub fn available(&self) -> ResourceSet {
        self.shared.lock().available
    }
}

impl Drop for ExecutionEngine {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.changed.notify_all();
        }
        let threads =
            std::mem::take(self.threads.get_mut().unwrap_or_else(PoisonError::into_inner));
        for handle in threads {
            if handle.join().is_err() {
                warn!("executor thread panicked");
            }
        }
    }
}

fn executor_loop(shared: &Shared) {
    loop {
        let job = {
            let mut state = shared.lock();
            loop {
                let admitted = state
                    .queue
                    .iter()
                    .position(|job| job.estimate.fits(&state.available));
                if let Some(job) = admitted.and_then(|pos| state.queue.remove(pos)) {
                    state.available = state.available.sub(&job.estimate);
                    state.running += 1;
                    break job;
                }
                if state.shutdown && state.queue.is_empty() {
                    return;
                }
                state = shared
                    .changed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        };

        let lease = Lease {
            shared,
            amount: job.estimate,
        };
        let reply = run_job(shared, &job);
        drop(lease);
        if job.reply.send(reply).is_err() {
            debug!(action = %job.node.id, "submitter stopped waiting");
        }
    }
}

fn run_job(shared: &Shared, job: &Job) -> Reply {
    if let Some(target) = shared.lock().aborted.clone() {
        return Err(EngineError::Aborted { target });
    }
    if shared.context.cancel.load(Ordering::SeqCst) {
        return Err(EngineError::Interrupted);
    }

    debug!(action = %job.node.id, strategy = job.strategy.name(), "executing");
    match job.strategy.execute(&job.node, &shared.context) {
        Ok(report) => Ok(report),
        Err(StrategyError::Aborted { target }) => {
            info!(target_label = %target, "aborting remaining executions");
            abort(shared, &target);
            Err(EngineError::Aborted { target })
        }
        Err(StrategyError::Interrupted) => Err(EngineError::Interrupted),
        Err(StrategyError::Internal(message)) => Err(EngineError::Internal(message)),
    }
}

/// Refuse further work and fail everything still queued
fn abort(shared: &Shared, target: &Label) {
    let drained: Vec<Job> = {
        let mut state = shared.lock();
        if state.aborted.is_none() {
            state.aborted = Some(target.clone());
        }
        state.queue.drain(..).collect()
    };
    for job in drained {
        if job
            .reply
            .send(Err(EngineError::Aborted {
                target: target.clone(),
            }))
            .is_err()
        {
            debug!(action = %job.node.id, "submitter stopped waiting");
        }
    }
    shared.changed.notify_all();
}
