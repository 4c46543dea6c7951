//! Build summary and failure taxonomy
//!
//! Produces build_summary.json and the stable process exit code.

mod build_summary;
mod failure;

pub use build_summary::{
    BuildFailure, BuildSummary, SummaryBuilder, TestLine, BUILD_SUMMARY_SCHEMA_ID,
    BUILD_SUMMARY_SCHEMA_VERSION,
};
pub use failure::{ExitCode, ExitCodeAggregator, FailureKind};
