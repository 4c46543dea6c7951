//! Collaborators the core consumes: file store and event reporter

mod fs;
mod reporter;

pub use fs::{Digest, FileState, FileStore, LocalFileStore};
pub use reporter::{
    CollectingReporter, Event, EventReporter, FanoutReporter, ReporterSink, TracingReporter,
};
