//! Value producers and the kind → producer registry

use std::collections::HashMap;
use std::sync::Arc;

use super::error::EvalError;
use super::evaluator::Environment;
use super::key::{Key, KeyKind};
use super::value::Value;

/// Computes the value of a key, requesting dependencies through `env`.
///
/// Producers must be deterministic in the values they request and return.
/// A failed dependency request is returned to the producer as an error; by
/// default the evaluator replaces the producer's result with
/// `DependencyFailed` afterwards.
pub trait ValueProducer: Send + Sync {
    fn produce(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, EvalError>;

    /// Keep the producer's own result when a dependency failed
    fn tolerates_dependency_failures(&self) -> bool {
        false
    }

    /// False for producers with external side effects; those are never
    /// re-run for determinism checking
    fn is_hermetic(&self) -> bool {
        true
    }
}

struct FnProducer<F> {
    f: F,
    tolerant: bool,
}

impl<F> ValueProducer for FnProducer<F>
where
    F: Fn(&Key, &mut Environment<'_>) -> Result<Value, EvalError> + Send + Sync,
{
    fn produce(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, EvalError> {
        (self.f)(key, env)
    }

    fn tolerates_dependency_failures(&self) -> bool {
        self.tolerant
    }
}

#[derive(Clone, Default)]
pub struct ProducerRegistry {
    producers: HashMap<KeyKind, Arc<dyn ValueProducer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the producer for `kind`, replacing any previous one
    pub fn register(&mut self, kind: KeyKind, producer: impl ValueProducer + 'static) -> &mut Self {
        self.producers.insert(kind, Arc::new(producer));
        self
    }

    pub fn register_fn<F>(&mut self, kind: KeyKind, f: F) -> &mut Self
    where
        F: Fn(&Key, &mut Environment<'_>) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.register(kind, FnProducer { f, tolerant: false })
    }

    pub fn register_tolerant_fn<F>(&mut self, kind: KeyKind, f: F) -> &mut Self
    where
        F: Fn(&Key, &mut Environment<'_>) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.register(kind, FnProducer { f, tolerant: true })
    }

    pub fn get(&self, kind: KeyKind) -> Option<Arc<dyn ValueProducer>> {
        self.producers.get(&kind).cloned()
    }

    pub fn contains(&self, kind: KeyKind) -> bool {
        self.producers.contains_key(&kind)
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.producers.keys().collect();
        kinds.sort();
        f.debug_struct("ProducerRegistry").field("kinds", &kinds).finish()
    }
}
