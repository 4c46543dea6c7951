//! Keel - incremental evaluation and action execution core
//!
//! This crate implements a memoizing key/value evaluator with lazy
//! invalidation. On top of it sit the producers that resolve a build
//! configuration, and an execution engine that runs actions (tests in
//! particular) under a shared resource budget.

pub mod action;
pub mod build;
pub mod collab;
pub mod config;
pub mod configuration;
pub mod graph;
pub mod packages;
pub mod signal;
pub mod summary;
pub mod test_strategy;

pub use build::{Build, BuildError, BuildOutcome, Manifest};
pub use graph::{EvalError, Evaluator, Key, KeyedValueStore, Value};
pub use summary::ExitCode;
