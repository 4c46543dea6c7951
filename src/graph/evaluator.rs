//! Parallel evaluator
//!
//! Each `evaluate` call spawns a bounded set of workers that pull keys from a
//! shared queue. A worker resolves a key on its own stack: dependencies a
//! producer requests are resolved recursively by the same worker, or waited
//! for on their slot's completion signal when another worker is already
//! building them. Producers that request several keys at once publish them
//! to the queue first so idle workers can build independent subgraphs in
//! parallel.
//!
//! Cycles are detected in two places: a worker requesting a key it is
//! itself building, and a wait-for graph across workers (worker A waits on a
//! key owned by B, which waits on a key owned by A).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use tracing::{debug, error, trace, warn};

use super::error::{CyclePath, EvalError};
use super::key::Key;
use super::producer::{ProducerRegistry, ValueProducer};
use super::store::{lock, DirtyReason, Freshness, KeyedValueStore, NodeState, Slot};
use super::value::Value;

const WORKER_STACK_SIZE: usize = 16 * 1024 * 1024;

/// Evaluator tuning
#[derive(Debug, Clone)]
pub struct EvaluatorOptions {
    pub workers: usize,
    /// Re-run producers of nodes that verified clean and compare results
    pub check_determinism: bool,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            check_determinism: false,
        }
    }
}

/// Per-root results of one `evaluate` call
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    values: HashMap<Key, Result<Value, EvalError>>,
    halted: Option<EvalError>,
}

impl EvaluationResult {
    pub fn get(&self, key: &Key) -> Option<&Result<Value, EvalError>> {
        self.values.get(key)
    }

    /// The error that stopped the evaluation early, if any
    pub fn halted(&self) -> Option<&EvalError> {
        self.halted.as_ref()
    }

    pub fn has_errors(&self) -> bool {
        self.halted.is_some() || self.values.values().any(Result::is_err)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Result<Value, EvalError>)> {
        self.values.iter()
    }
}

/// Drives producers to completion over a shared store
pub struct Evaluator {
    store: Arc<KeyedValueStore>,
    registry: ProducerRegistry,
    options: EvaluatorOptions,
    interrupt: Arc<AtomicBool>,
    serial: Mutex<()>,
}

impl Evaluator {
    pub fn new(store: Arc<KeyedValueStore>, registry: ProducerRegistry, options: EvaluatorOptions) -> Self {
        Self {
            store,
            registry,
            options,
            interrupt: Arc::new(AtomicBool::new(false)),
            serial: Mutex::new(()),
        }
    }

    /// Share an interrupt flag (set by the signal handler)
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn store(&self) -> &Arc<KeyedValueStore> {
        &self.store
    }

    /// Evaluate `roots`. Calls on one evaluator are serialized.
    pub fn evaluate(&self, roots: &[Key]) -> EvaluationResult {
        let _serial = lock(&self.serial);
        let generation = self.store.next_generation();
        let workers = self.options.workers.max(1);
        let run = Run::new(self, roots, generation, workers);
        debug!(
            roots = roots.len(),
            workers,
            generation,
            version = run.version,
            "evaluation started"
        );

        thread::scope(|scope| {
            for worker in 0..workers {
                let run = &run;
                let spawned = thread::Builder::new()
                    .name(format!("keel-eval-{worker}"))
                    .stack_size(WORKER_STACK_SIZE)
                    .spawn_scoped(scope, move || run.work(worker));
                if let Err(e) = spawned {
                    run.halt(EvalError::Internal(format!(
                        "failed to spawn evaluator worker: {e}"
                    )));
                    break;
                }
            }
        });

        run.finish()
    }
}

/// What a dependency request saw
struct Resolved {
    result: Result<Value, EvalError>,
    cacheable: bool,
    changed_at: u64,
}

impl Resolved {
    fn from_data(data: &super::store::SlotData) -> Self {
        Self {
            result: data
                .result
                .clone()
                .unwrap_or_else(|| Err(EvalError::Internal("node has no value".to_string()))),
            cacheable: data.cacheable,
            changed_at: data.changed_at,
        }
    }

    /// A failure not backed by a committed node
    fn synthetic(err: EvalError) -> Self {
        Self {
            cacheable: err.is_cacheable(),
            result: Err(err),
            changed_at: u64::MAX,
        }
    }
}

#[derive(Default)]
struct WorkQueue {
    items: VecDeque<Key>,
    queued: HashSet<Key>,
    in_flight: usize,
}

/// Building stacks and blocking edges of the workers
struct WaitGraph {
    stacks: Vec<Vec<Key>>,
    waiting_on: Vec<Option<(Key, usize)>>,
}

impl WaitGraph {
    fn new(workers: usize) -> Self {
        Self {
            stacks: vec![Vec::new(); workers],
            waiting_on: vec![None; workers],
        }
    }

    fn push(&mut self, worker: usize, key: &Key) {
        self.stacks[worker].push(key.clone());
    }

    fn pop(&mut self, worker: usize, key: &Key) {
        if let Some(pos) = self.stacks[worker].iter().rposition(|k| k == key) {
            self.stacks[worker].truncate(pos);
        }
    }

    /// Cycle closed by `worker` requesting a key it is itself building
    fn cycle_on_stack(&self, worker: usize, key: &Key) -> CyclePath {
        let stack = &self.stacks[worker];
        let start = stack.iter().position(|k| k == key).unwrap_or(0);
        CyclePath(stack[start..].to_vec())
    }

    /// Record that `worker` waits on `key` owned by `owner`; fails with the
    /// cycle path if the wait closes a loop of workers
    fn begin_wait(&mut self, worker: usize, key: &Key, owner: usize) -> Result<(), CyclePath> {
        self.waiting_on[worker] = Some((key.clone(), owner));

        let mut segments = Vec::new();
        let (mut k, mut w) = (key.clone(), owner);
        for _ in 0..=self.stacks.len() {
            let Some(pos) = self.stacks[w].iter().position(|s| *s == k) else {
                // stale edge: the owner already finished that key
                return Ok(());
            };
            if w == worker {
                let mut path = self.stacks[worker][pos..].to_vec();
                path.extend(segments);
                self.waiting_on[worker] = None;
                return Err(CyclePath(path));
            }
            segments.extend_from_slice(&self.stacks[w][pos..]);
            match &self.waiting_on[w] {
                Some((next_key, next_owner)) => {
                    k = next_key.clone();
                    w = *next_owner;
                }
                None => return Ok(()),
            }
        }
        Ok(())
    }

    fn end_wait(&mut self, worker: usize) {
        self.waiting_on[worker] = None;
    }
}

/// State of one `evaluate` call
struct Run<'e> {
    evaluator: &'e Evaluator,
    version: u64,
    generation: u64,
    queue: Mutex<WorkQueue>,
    queue_changed: Condvar,
    waits: Mutex<WaitGraph>,
    halt: Mutex<Option<EvalError>>,
    halted: AtomicBool,
    roots: Vec<Key>,
    root_set: HashSet<Key>,
    results: Mutex<HashMap<Key, Result<Value, EvalError>>>,
}

fn relock<'a, T>(condvar: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    condvar.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

impl<'e> Run<'e> {
    fn new(evaluator: &'e Evaluator, roots: &[Key], generation: u64, workers: usize) -> Self {
        let mut queue = WorkQueue::default();
        for root in roots {
            if queue.queued.insert(root.clone()) {
                queue.items.push_back(root.clone());
            }
        }
        Self {
            evaluator,
            version: evaluator.store.version(),
            generation,
            queue: Mutex::new(queue),
            queue_changed: Condvar::new(),
            waits: Mutex::new(WaitGraph::new(workers)),
            halt: Mutex::new(None),
            halted: AtomicBool::new(false),
            roots: roots.to_vec(),
            root_set: roots.iter().cloned().collect(),
            results: Mutex::new(HashMap::new()),
        }
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    fn halt_error(&self) -> EvalError {
        lock(&self.halt).clone().unwrap_or(EvalError::Interrupted)
    }

    /// Stop the evaluation; the first halting error wins
    fn halt(&self, err: EvalError) {
        {
            let mut halt = lock(&self.halt);
            if halt.is_none() {
                error!(error = %err, "evaluation halted");
                *halt = Some(err);
            }
        }
        self.halted.store(true, Ordering::SeqCst);
        let _queue = lock(&self.queue);
        self.queue_changed.notify_all();
    }

    /// The error a producer sees instead of a dependency once the
    /// evaluation is stopping
    fn check_interrupt(&self) -> Option<EvalError> {
        if self.evaluator.interrupt.load(Ordering::SeqCst) && !self.is_halted() {
            self.halt(EvalError::Interrupted);
        }
        if self.is_halted() {
            Some(self.halt_error())
        } else {
            None
        }
    }

    fn enqueue(&self, keys: &[Key]) {
        let mut queue = lock(&self.queue);
        let mut added = false;
        for key in keys {
            if queue.queued.insert(key.clone()) {
                queue.items.push_back(key.clone());
                added = true;
            }
        }
        if added {
            self.queue_changed.notify_all();
        }
    }

    fn work(&self, worker: usize) {
        loop {
            let key = {
                let mut queue = lock(&self.queue);
                loop {
                    if self.is_halted() {
                        self.queue_changed.notify_all();
                        return;
                    }
                    if let Some(key) = queue.items.pop_front() {
                        queue.in_flight += 1;
                        break key;
                    }
                    if queue.in_flight == 0 {
                        self.queue_changed.notify_all();
                        return;
                    }
                    queue = relock(&self.queue_changed, queue);
                }
            };

            let resolved = self.resolve(worker, &key);
            if self.root_set.contains(&key) {
                lock(&self.results).insert(key, resolved.result);
            }

            let mut queue = lock(&self.queue);
            queue.in_flight -= 1;
            self.queue_changed.notify_all();
        }
    }

    fn resolve(&self, worker: usize, key: &Key) -> Resolved {
        let slot = self.evaluator.store.slot(key);
        let dirty = {
            let mut data = lock(&slot.data);
            loop {
                let state = data.state;
                match state {
                    NodeState::Built | NodeState::Failed => {
                        match data.freshness(self.version, self.generation) {
                            Freshness::Fresh => return Resolved::from_data(&data),
                            Freshness::Stale(reason) => {
                                if let Err(e) = data.mark_dirty(key, reason) {
                                    return self.internal(e.to_string());
                                }
                            }
                        }
                    }
                    NodeState::Building => {
                        let Some(owner) = data.owner else {
                            data = relock(&slot.done, data);
                            continue;
                        };
                        if owner == worker {
                            let path = lock(&self.waits).cycle_on_stack(worker, key);
                            warn!(cycle = %path, "dependency cycle");
                            return Resolved::synthetic(EvalError::Cycle { path });
                        }
                        if let Err(path) = lock(&self.waits).begin_wait(worker, key, owner) {
                            warn!(cycle = %path, "dependency cycle across workers");
                            return Resolved::synthetic(EvalError::Cycle { path });
                        }
                        data = relock(&slot.done, data);
                        lock(&self.waits).end_wait(worker);
                    }
                    NodeState::Unbuilt | NodeState::Dirty => {
                        match data.begin_build(key, Some(worker), self.version) {
                            Ok(reason) => {
                                lock(&self.waits).push(worker, key);
                                break reason;
                            }
                            Err(e) => return self.internal(e.to_string()),
                        }
                    }
                }
            }
        };

        let resolved = self.build(worker, key, &slot, dirty);
        lock(&self.waits).pop(worker, key);
        resolved
    }

    fn internal(&self, message: String) -> Resolved {
        let err = EvalError::Internal(message);
        self.halt(err.clone());
        Resolved::synthetic(err)
    }

    fn build(&self, worker: usize, key: &Key, slot: &Slot, dirty: Option<DirtyReason>) -> Resolved {
        let Some(producer) = self.evaluator.registry.get(key.kind()) else {
            let err = EvalError::Internal(format!("no producer registered for {}", key.kind()));
            self.halt(err.clone());
            return self.commit(key, slot, Err(err), Vec::new(), false);
        };

        if dirty == Some(DirtyReason::Unverified) && self.dependencies_unchanged(worker, slot) {
            let resolved = {
                let mut data = lock(&slot.data);
                let restored = data.restore(key, self.version, self.generation);
                slot.done.notify_all();
                if let Err(e) = restored {
                    drop(data);
                    return self.internal(e.to_string());
                }
                Resolved::from_data(&data)
            };
            trace!(key = %key, "verified clean");
            if self.evaluator.options.check_determinism && producer.is_hermetic() {
                return self.recheck(worker, key, slot, producer.as_ref(), resolved);
            }
            return resolved;
        }

        debug!(key = %key, ?dirty, "building");
        let (result, deps, cacheable) = self.run_producer(worker, key, producer.as_ref());
        self.commit(key, slot, result, deps, cacheable)
    }

    /// Re-resolve recorded dependencies in order; false as soon as one
    /// changed after the node was last verified
    fn dependencies_unchanged(&self, worker: usize, slot: &Slot) -> bool {
        let (deps, verified_at) = {
            let data = lock(&slot.data);
            (data.deps.clone(), data.verified_at)
        };
        for dep in deps {
            if self.is_halted() {
                return false;
            }
            if self.resolve(worker, &dep).changed_at > verified_at {
                return false;
            }
        }
        true
    }

    fn run_producer(
        &self,
        worker: usize,
        key: &Key,
        producer: &dyn ValueProducer,
    ) -> (Result<Value, EvalError>, Vec<Key>, bool) {
        let mut env = Environment::new(self, worker);
        let produced = match self.check_interrupt() {
            Some(err) => Err(err),
            None => producer.produce(key, &mut env),
        };
        let Environment {
            deps,
            deps_cacheable,
            first_failure,
            ..
        } = env;

        let result = match (produced, first_failure) {
            (Err(err), _) if err.is_halting() => Err(err),
            (_, Some((dependency, err))) if !producer.tolerates_dependency_failures() => {
                match err {
                    err if err.is_halting() => Err(err),
                    EvalError::Cycle { path } if path.contains(key) => Err(EvalError::Cycle { path }),
                    err => Err(EvalError::dependency_failed(dependency, &err)),
                }
            }
            (produced, _) => produced,
        };

        let cacheable = deps_cacheable
            && match &result {
                Ok(value) => value.is_cacheable(),
                Err(err) => err.is_cacheable(),
            };
        if let Err(err) = &result {
            if err.is_halting() {
                self.halt(err.clone());
            }
        }
        (result, deps, cacheable)
    }

    fn commit(
        &self,
        key: &Key,
        slot: &Slot,
        result: Result<Value, EvalError>,
        deps: Vec<Key>,
        cacheable: bool,
    ) -> Resolved {
        let mut data = lock(&slot.data);
        let committed = data.commit(key, result, deps, cacheable, self.generation);
        slot.done.notify_all();
        match committed {
            Ok(()) => Resolved::from_data(&data),
            Err(e) => {
                drop(data);
                self.internal(e.to_string())
            }
        }
    }

    /// Run the producer of a clean node again and commit the result a second
    /// time; the store rejects a differing value
    fn recheck(
        &self,
        worker: usize,
        key: &Key,
        slot: &Slot,
        producer: &dyn ValueProducer,
        clean: Resolved,
    ) -> Resolved {
        let (result, deps, cacheable) = self.run_producer(worker, key, producer);
        if self.is_halted() {
            return clean;
        }
        let mut data = lock(&slot.data);
        match data.commit(key, result, deps, cacheable, self.generation) {
            Ok(()) => clean,
            Err(e) => {
                drop(data);
                self.internal(e.to_string())
            }
        }
    }

    fn finish(self) -> EvaluationResult {
        let halted = self.halt.into_inner().unwrap_or_else(PoisonError::into_inner);
        let mut results = self.results.into_inner().unwrap_or_else(PoisonError::into_inner);
        let values = self
            .roots
            .iter()
            .map(|root| {
                let result = results.remove(root).unwrap_or_else(|| {
                    Err(halted.clone().unwrap_or_else(|| {
                        EvalError::Internal(format!("{root} was not evaluated"))
                    }))
                });
                (root.clone(), result)
            })
            .collect();
        debug!(halted = halted.is_some(), "evaluation finished");
        EvaluationResult { values, halted }
    }
}

/// Dependency access handed to a producer
pub struct Environment<'r> {
    run: &'r Run<'r>,
    worker: usize,
    deps: Vec<Key>,
    seen: HashSet<Key>,
    deps_cacheable: bool,
    first_failure: Option<(Key, EvalError)>,
}

impl<'r> Environment<'r> {
    fn new(run: &'r Run<'r>, worker: usize) -> Self {
        Self {
            run,
            worker,
            deps: Vec::new(),
            seen: HashSet::new(),
            deps_cacheable: true,
            first_failure: None,
        }
    }

    /// Resolve a dependency and record the edge
    pub fn get(&mut self, key: Key) -> Result<Value, EvalError> {
        if let Some(err) = self.run.check_interrupt() {
            return Err(err);
        }
        let resolved = self.run.resolve(self.worker, &key);
        self.deps_cacheable &= resolved.cacheable;
        if let Err(err) = &resolved.result {
            if self.first_failure.is_none() {
                self.first_failure = Some((key.clone(), err.clone()));
            }
        }
        if self.seen.insert(key.clone()) {
            self.deps.push(key);
        }
        resolved.result
    }

    /// Resolve several independent dependencies, letting idle workers build
    /// them in parallel. Results are in request order.
    pub fn get_many(&mut self, keys: &[Key]) -> Vec<Result<Value, EvalError>> {
        if keys.len() > 1 {
            self.run.enqueue(keys);
        }
        keys.iter().map(|key| self.get(key.clone())).collect()
    }

    /// True once the evaluation is being interrupted or halted
    pub fn is_interrupted(&self) -> bool {
        self.run.evaluator.interrupt.load(Ordering::SeqCst) || self.run.is_halted()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::KeyKind;
    use std::sync::atomic::AtomicUsize;

    fn text(s: impl Into<String>) -> Value {
        Value::Text(Some(s.into()))
    }

    fn name(key: &Key) -> &str {
        match key {
            Key::Precomputed(name) => name,
            _ => "",
        }
    }

    #[test]
    fn test_diamond_records_exact_edges() {
        let mut registry = ProducerRegistry::new();
        registry.register_fn(KeyKind::Precomputed, |key: &Key, env: &mut Environment<'_>| {
            match name(key) {
                "top" => {
                    let parts = env.get_many(&[Key::precomputed("left"), Key::precomputed("right")]);
                    let mut out = String::new();
                    for part in parts {
                        out.push_str(part?.as_text()?.as_deref().unwrap_or(""));
                    }
                    Ok(text(out))
                }
                "left" | "right" => {
                    let base = env.get(Key::precomputed("base"))?;
                    Ok(text(format!("{}+{}", name(key), base.as_text()?.as_deref().unwrap_or(""))))
                }
                _ => Ok(text("b")),
            }
        });
        let store = Arc::new(KeyedValueStore::new());
        let evaluator = Evaluator::new(Arc::clone(&store), registry, EvaluatorOptions::default());

        let result = evaluator.evaluate(&[Key::precomputed("top")]);

        assert_eq!(
            result.get(&Key::precomputed("top")).unwrap().as_ref().unwrap(),
            &text("left+bright+b")
        );
        assert_eq!(
            store.dependencies(&Key::precomputed("top")).unwrap(),
            vec![Key::precomputed("left"), Key::precomputed("right")]
        );
        assert_eq!(
            store.dependencies(&Key::precomputed("left")).unwrap(),
            vec![Key::precomputed("base")]
        );
    }

    #[test]
    fn test_missing_producer_halts() {
        let store = Arc::new(KeyedValueStore::new());
        let evaluator = Evaluator::new(store, ProducerRegistry::new(), EvaluatorOptions::default());

        let result = evaluator.evaluate(&[Key::precomputed("x")]);

        assert!(matches!(result.halted(), Some(EvalError::Internal(_))));
        assert!(result.has_errors());
    }

    #[test]
    fn test_interrupt_aborts_evaluation() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut registry = ProducerRegistry::new();
        registry.register_fn(KeyKind::Precomputed, move |key: &Key, env: &mut Environment<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
            if name(key) == "root" {
                env.get(Key::precomputed("leaf"))?;
            }
            Ok(text("v"))
        });
        let flag = Arc::new(AtomicBool::new(true));
        let evaluator = Evaluator::new(
            Arc::new(KeyedValueStore::new()),
            registry,
            EvaluatorOptions {
                workers: 1,
                check_determinism: false,
            },
        )
        .with_interrupt(flag);

        let result = evaluator.evaluate(&[Key::precomputed("root")]);

        assert_eq!(result.halted(), Some(&EvalError::Interrupted));
        assert_eq!(
            result.get(&Key::precomputed("root")),
            Some(&Err(EvalError::Interrupted))
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wait_graph_detects_cross_worker_loop() {
        let a = Key::precomputed("a");
        let b = Key::precomputed("b");
        let c = Key::precomputed("c");
        let mut graph = WaitGraph::new(2);
        graph.push(0, &a);
        graph.push(1, &b);
        graph.push(1, &c);

        // worker 1 (building b, c) waits on a, owned by worker 0
        graph.begin_wait(1, &a, 0).unwrap();
        // worker 0 (building a) waits on b, owned by worker 1
        let path = graph.begin_wait(0, &b, 1).unwrap_err();

        assert_eq!(path.keys(), &[a, b, c]);
    }

    #[test]
    fn test_wait_graph_ignores_stale_edges() {
        let a = Key::precomputed("a");
        let b = Key::precomputed("b");
        let mut graph = WaitGraph::new(2);
        graph.push(1, &b);
        graph.begin_wait(1, &a, 0).unwrap();

        // worker 0 no longer builds a, so the edge from worker 1 is stale
        assert!(graph.begin_wait(0, &b, 1).is_ok());
    }
}
