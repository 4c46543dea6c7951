//! Driver-injected values
//!
//! The driver writes named values into a table and invalidates the matching
//! `Precomputed` keys; the producer reads the table back. A missing entry is
//! the absent value, not an error.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use super::error::EvalError;
use super::evaluator::Environment;
use super::key::Key;
use super::producer::ValueProducer;
use super::value::Value;

#[derive(Debug, Clone, Default)]
pub struct PrecomputedTable {
    values: Arc<RwLock<HashMap<String, String>>>,
}

impl PrecomputedTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, returning the key that must be invalidated
    pub fn set(&self, name: impl Into<String>, value: impl Into<String>) -> Key {
        let name = name.into();
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.clone(), value.into());
        Key::Precomputed(name)
    }

    pub fn remove(&self, name: &str) -> Key {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        Key::precomputed(name)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

pub struct PrecomputedProducer {
    table: PrecomputedTable,
}

impl PrecomputedProducer {
    pub fn new(table: PrecomputedTable) -> Self {
        Self { table }
    }
}

impl ValueProducer for PrecomputedProducer {
    fn produce(&self, key: &Key, _env: &mut Environment<'_>) -> Result<Value, EvalError> {
        match key {
            Key::Precomputed(name) => Ok(Value::Text(self.table.get(name))),
            other => Err(EvalError::Internal(format!(
                "precomputed producer asked for {other}"
            ))),
        }
    }
}
