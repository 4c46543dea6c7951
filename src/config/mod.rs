//! Layered settings
//!
//! Merge order (last wins):
//! 1. Built-in defaults
//! 2. User config (~/.config/keel/config.toml)
//! 3. Workspace config (.keel/config.toml)
//! 4. CLI flags

mod defaults;
mod effective;
mod merge;

pub use defaults::BuiltinDefaults;
pub use effective::{
    ConfigError, ConfigOrigin, ConfigSource, EffectiveConfig, EvaluatorSettings,
    ExecutionSettings, Settings, TestOutput, TestSettings, WorkspaceStatusSettings,
};
pub use merge::{deep_merge, merge_layers};
