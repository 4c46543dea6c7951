//! Command execution collaborator for keel strategies.
//!
//! Strategies describe a subprocess with a [`CommandSpec`] and hand it to a
//! [`CommandRunner`] together with a [`FileOutErr`] that owns the log handles.
//! The runner distinguishes "could not start" from "ran and exited non-zero"
//! so callers can classify infrastructure failures separately from failures
//! of the code under build.

mod command;
mod local;
mod outerr;

pub use command::{
    CommandError, CommandOutput, CommandRunner, CommandSpec, LineSink, ResourceHint, Stream,
};
pub use local::LocalCommandRunner;
pub use outerr::FileOutErr;
