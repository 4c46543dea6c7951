//! Action graph and execution
//!
//! Actions are the leaves of the evaluation graph that do real subprocess
//! work. Their inputs are graph dependencies, so an action only runs once
//! everything it reads is materialized.

mod artifact;
mod cache;
mod engine;
mod graph;
mod node;
mod producer;
mod resources;
mod strategy;
mod workspace_status;

pub use artifact::Artifact;
pub use cache::ActionCache;
pub use engine::{EngineConfig, EngineError, ExecutionEngine, PendingExecution, DEFAULT_STRATEGY};
pub use graph::{ActionGraph, ActionGraphError};
pub use node::{ActionGraphNode, ActionId, ActionKind, ActionOutcome, TestActionInfo};
pub use producer::{ActionExecutionProducer, FileStateProducer};
pub use resources::ResourceSet;
pub use strategy::{
    ActionReport, ExecutionContext, ExecutionStrategy, LocalStrategy, StrategyError,
    StrategyRegistry,
};
pub use workspace_status::{
    render_stable_status, workspace_status_action, WorkspaceStatusStrategy, STABLE_STATUS,
    VOLATILE_STATUS, WORKSPACE_STATUS_MNEMONIC,
};
