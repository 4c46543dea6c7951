//! Keyed value store
//!
//! Node states: UNBUILT → BUILDING → {BUILT | FAILED}, and BUILT/FAILED →
//! DIRTY → BUILDING on invalidation. A node never returns to UNBUILT.
//!
//! Keys live in an arena of index-stable slots, each with its own lock and
//! completion signal; there is no lock over the whole graph during
//! evaluation. Invalidation only bumps a global version and marks the listed
//! keys. Everything downstream is found stale lazily, when the evaluator
//! next visits it and compares versions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock};

use super::error::EvalError;
use super::key::Key;
use super::value::Value;

/// Node state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unbuilt,
    Building,
    Built,
    Failed,
    Dirty,
}

impl NodeState {
    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: NodeState) -> bool {
        matches!(
            (self, target),
            (NodeState::Unbuilt, NodeState::Building)
                | (NodeState::Dirty, NodeState::Building)
                | (NodeState::Building, NodeState::Built)
                | (NodeState::Building, NodeState::Failed)
                | (NodeState::Built, NodeState::Dirty)
                | (NodeState::Failed, NodeState::Dirty)
        )
    }

    pub fn is_done(&self) -> bool {
        matches!(self, NodeState::Built | NodeState::Failed)
    }
}

/// Why a node is dirty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirtyReason {
    /// Invalidated explicitly, or produced a non-cacheable value in an
    /// earlier evaluation call; must be rebuilt
    Direct,
    /// Possibly affected by an upstream change; dependencies are checked first
    Unverified,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("illegal transition of {key} from {from:?} to {to:?}")]
    IllegalTransition {
        key: Key,
        from: NodeState,
        to: NodeState,
    },

    #[error("commit of {key} is not legal in state {state:?}")]
    IllegalCommit { key: Key, state: NodeState },

    #[error("non-deterministic producer for {key}: {detail}")]
    NonDeterministic { key: Key, detail: String },
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
pub(crate) struct SlotData {
    pub(crate) state: NodeState,
    pub(crate) result: Option<Result<Value, EvalError>>,
    pub(crate) deps: Vec<Key>,
    pub(crate) cacheable: bool,
    /// Version at which the value last changed
    pub(crate) changed_at: u64,
    /// Latest version at which the value was known to be current
    pub(crate) verified_at: u64,
    /// Evaluation call that last produced or verified the value
    pub(crate) verified_generation: u64,
    pub(crate) dirty: Option<DirtyReason>,
    /// Evaluator worker currently building the node
    pub(crate) owner: Option<usize>,
    build_started_at: u64,
    invalidated_while_building: bool,
}

/// Outcome of looking at a finished node
pub(crate) enum Freshness {
    Fresh,
    Stale(DirtyReason),
}

impl SlotData {
    fn new() -> Self {
        Self {
            state: NodeState::Unbuilt,
            result: None,
            deps: Vec::new(),
            cacheable: true,
            changed_at: 0,
            verified_at: 0,
            verified_generation: 0,
            dirty: None,
            owner: None,
            build_started_at: 0,
            invalidated_while_building: false,
        }
    }

    fn transition(&mut self, key: &Key, to: NodeState) -> Result<(), StoreError> {
        if !self.state.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                key: key.clone(),
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }

    pub(crate) fn freshness(&self, version: u64, generation: u64) -> Freshness {
        if let Some(reason) = self.dirty {
            return Freshness::Stale(reason);
        }
        if !self.cacheable && self.verified_generation != generation {
            return Freshness::Stale(DirtyReason::Direct);
        }
        if self.verified_at < version {
            return Freshness::Stale(DirtyReason::Unverified);
        }
        Freshness::Fresh
    }

    pub(crate) fn mark_dirty(&mut self, key: &Key, reason: DirtyReason) -> Result<(), StoreError> {
        if self.state != NodeState::Dirty {
            self.transition(key, NodeState::Dirty)?;
        }
        self.dirty = Some(match (self.dirty, reason) {
            (Some(DirtyReason::Direct), _) => DirtyReason::Direct,
            (_, reason) => reason,
        });
        Ok(())
    }

    /// Move to BUILDING, returning why the node was dirty (if it was)
    pub(crate) fn begin_build(
        &mut self,
        key: &Key,
        owner: Option<usize>,
        version: u64,
    ) -> Result<Option<DirtyReason>, StoreError> {
        self.transition(key, NodeState::Building)?;
        self.owner = owner;
        self.build_started_at = version;
        self.invalidated_while_building = false;
        Ok(self.dirty.take())
    }

    pub(crate) fn commit(
        &mut self,
        key: &Key,
        result: Result<Value, EvalError>,
        deps: Vec<Key>,
        cacheable: bool,
        generation: u64,
    ) -> Result<(), StoreError> {
        match self.state {
            NodeState::Building => {
                let to = if result.is_ok() {
                    NodeState::Built
                } else {
                    NodeState::Failed
                };
                self.transition(key, to)?;
                self.result = Some(result);
                self.deps = deps;
                self.cacheable = cacheable;
                self.changed_at = self.build_started_at;
                self.verified_at = self.build_started_at;
                self.verified_generation = generation;
                self.owner = None;
                if self.invalidated_while_building {
                    self.invalidated_while_building = false;
                    self.mark_dirty(key, DirtyReason::Direct)?;
                }
                Ok(())
            }
            NodeState::Built | NodeState::Failed => {
                if self.result.as_ref() != Some(&result) {
                    return Err(StoreError::NonDeterministic {
                        key: key.clone(),
                        detail: "value differs from the committed value".to_string(),
                    });
                }
                if self.deps != deps {
                    return Err(StoreError::NonDeterministic {
                        key: key.clone(),
                        detail: "dependencies differ from the committed dependencies".to_string(),
                    });
                }
                Ok(())
            }
            state => Err(StoreError::IllegalCommit {
                key: key.clone(),
                state,
            }),
        }
    }

    /// Return a BUILDING node whose dependencies turned out unchanged to its
    /// previous terminal state
    pub(crate) fn restore(&mut self, key: &Key, version: u64, generation: u64) -> Result<(), StoreError> {
        let to = match &self.result {
            Some(Ok(_)) => NodeState::Built,
            Some(Err(_)) => NodeState::Failed,
            None => {
                return Err(StoreError::IllegalCommit {
                    key: key.clone(),
                    state: self.state,
                })
            }
        };
        self.transition(key, to)?;
        self.verified_at = version;
        self.verified_generation = generation;
        self.owner = None;
        if self.invalidated_while_building {
            self.invalidated_while_building = false;
            self.mark_dirty(key, DirtyReason::Direct)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) data: Mutex<SlotData>,
    pub(crate) done: Condvar,
}

#[derive(Debug, Default)]
struct Arena {
    index: HashMap<Key, usize>,
    slots: Vec<Arc<Slot>>,
}

/// Memoization substrate: key → value, dependencies and validity
#[derive(Debug, Default)]
pub struct KeyedValueStore {
    arena: RwLock<Arena>,
    version: AtomicU64,
    generation: AtomicU64,
}

impl KeyedValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current graph version (bumped by every invalidation)
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.arena
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .slots
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn existing(&self, key: &Key) -> Option<Arc<Slot>> {
        let arena = self.arena.read().unwrap_or_else(PoisonError::into_inner);
        arena.index.get(key).map(|&id| Arc::clone(&arena.slots[id]))
    }

    pub(crate) fn slot(&self, key: &Key) -> Arc<Slot> {
        if let Some(slot) = self.existing(key) {
            return slot;
        }
        let mut arena = self.arena.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(&id) = arena.index.get(key) {
            return Arc::clone(&arena.slots[id]);
        }
        let slot = Arc::new(Slot {
            data: Mutex::new(SlotData::new()),
            done: Condvar::new(),
        });
        let id = arena.slots.len();
        arena.slots.push(Arc::clone(&slot));
        arena.index.insert(key.clone(), id);
        slot
    }

    pub(crate) fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &Key) -> Option<NodeState> {
        self.existing(key).map(|slot| lock(&slot.data).state)
    }

    /// Committed value of a BUILT or FAILED node
    pub fn value(&self, key: &Key) -> Option<Result<Value, EvalError>> {
        let slot = self.existing(key)?;
        let data = lock(&slot.data);
        if data.state.is_done() {
            data.result.clone()
        } else {
            None
        }
    }

    /// Dependencies recorded by the node's most recent evaluation
    pub fn dependencies(&self, key: &Key) -> Option<Vec<Key>> {
        self.existing(key).map(|slot| lock(&slot.data).deps.clone())
    }

    pub fn set_building(&self, key: &Key) -> Result<(), StoreError> {
        let slot = self.slot(key);
        let mut data = lock(&slot.data);
        data.begin_build(key, None, self.version()).map(|_| ())
    }

    /// Commit a result. Legal from BUILDING; a repeated commit of an
    /// identical value and dependency set is a no-op, anything else is
    /// reported as non-determinism.
    pub fn commit(
        &self,
        key: &Key,
        result: Result<Value, EvalError>,
        deps: Vec<Key>,
        cacheable: bool,
    ) -> Result<(), StoreError> {
        let slot = self.slot(key);
        let mut data = lock(&slot.data);
        let outcome = data.commit(key, result, deps, cacheable, self.generation());
        slot.done.notify_all();
        outcome
    }

    /// Mark `keys` dirty and advance the version. Dependents are found
    /// stale on their next visit. Returns the new version.
    pub fn invalidate(&self, keys: &[Key]) -> u64 {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        for key in keys {
            let Some(slot) = self.existing(key) else {
                continue;
            };
            let mut data = lock(&slot.data);
            match data.state {
                NodeState::Built | NodeState::Failed | NodeState::Dirty => {
                    // Built/Failed/Dirty can always move to Dirty
                    let _ = data.mark_dirty(key, DirtyReason::Direct);
                }
                NodeState::Building => data.invalidated_while_building = true,
                NodeState::Unbuilt => {}
            }
        }
        version
    }
}
