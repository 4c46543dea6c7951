//! Incremental evaluation graph
//!
//! Keys name computations, producers compute them, the store memoizes the
//! results together with the dependency edges producers recorded, and the
//! evaluator drives everything to completion on a pool of workers.

mod error;
mod evaluator;
mod key;
mod precomputed;
mod producer;
mod store;
mod value;

pub use error::{CyclePath, EvalError, InvalidConfiguration};
pub use evaluator::{Environment, EvaluationResult, Evaluator, EvaluatorOptions};
pub use key::{Key, KeyKind};
pub use precomputed::{PrecomputedProducer, PrecomputedTable};
pub use producer::{ProducerRegistry, ValueProducer};
pub use store::{DirtyReason, KeyedValueStore, NodeState, StoreError};
pub use value::Value;
