//! Test execution strategy

mod env;
mod phase;
mod strategy;

pub use env::{default_test_env, source_root, test_env};
pub use phase::{PhaseTracker, TestPhase};
pub use strategy::{StandaloneTestStrategy, TestStrategySettings, TEST_MNEMONIC};
