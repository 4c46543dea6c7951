//! Event/result reporting collaborator
//!
//! Reporting is fire-and-forget: `post` never fails and never blocks on the
//! consumer.

use std::sync::{Arc, Mutex, PoisonError};

use keel_exec::{LineSink, Stream};
use keel_protocol::TestResultRecord;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Error(String),
    Warning(String),
    Info(String),
    TestResult(TestResultRecord),
    /// A line of streamed test output
    Output {
        target: String,
        stream: Stream,
        line: String,
    },
}

pub trait EventReporter: Send + Sync {
    fn post(&self, event: Event);
}

/// Forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl EventReporter for TracingReporter {
    fn post(&self, event: Event) {
        match event {
            Event::Error(message) => error!("{message}"),
            Event::Warning(message) => warn!("{message}"),
            Event::Info(message) => info!("{message}"),
            Event::TestResult(record) => info!(
                target_label = %record.target,
                status = ?record.status,
                cacheable = record.cacheable,
                "test result"
            ),
            Event::Output { target, stream, line } => {
                info!(target_label = %target, ?stream, "{line}")
            }
        }
    }
}

/// Keeps every event in memory, in posting order
#[derive(Debug, Default)]
pub struct CollectingReporter {
    events: Mutex<Vec<Event>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn test_results(&self) -> Vec<TestResultRecord> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::TestResult(record) => Some(record),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl EventReporter for CollectingReporter {
    fn post(&self, event: Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// Posts to several reporters
#[derive(Default)]
pub struct FanoutReporter {
    reporters: Vec<Arc<dyn EventReporter>>,
}

impl FanoutReporter {
    pub fn new(reporters: Vec<Arc<dyn EventReporter>>) -> Self {
        Self { reporters }
    }
}

impl EventReporter for FanoutReporter {
    fn post(&self, event: Event) {
        if let Some((last, rest)) = self.reporters.split_last() {
            for reporter in rest {
                reporter.post(event.clone());
            }
            last.post(event);
        }
    }
}

/// Tees a test's output lines into the reporter as `Output` events
pub struct ReporterSink {
    target: String,
    reporter: Arc<dyn EventReporter>,
}

impl ReporterSink {
    pub fn new(target: impl Into<String>, reporter: Arc<dyn EventReporter>) -> Self {
        Self {
            target: target.into(),
            reporter,
        }
    }
}

impl LineSink for ReporterSink {
    fn line(&self, stream: Stream, line: &str) {
        self.reporter.post(Event::Output {
            target: self.target.clone(),
            stream,
            line: line.to_string(),
        });
    }
}
