//! Interrupt handling (SIGINT/SIGTERM)
//!
//! The first signal raises the shared interrupt flag: the evaluator stops
//! between dependency requests and running commands are terminated. A second
//! signal asks the driver to exit without waiting for cleanup.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use tracing::warn;

/// Action to take after receiving a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// First signal: interrupt the build
    Interrupt,
    /// Second signal: exit immediately
    ImmediateExit,
    /// Third and later signals
    Ignore,
}

/// Shared interrupt state
#[derive(Debug, Default)]
pub struct InterruptState {
    flag: Arc<AtomicBool>,
    immediate_exit: AtomicBool,
    signal_count: AtomicU8,
}

impl InterruptState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The flag polled by the evaluator, the engine and command runners
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }

    pub fn is_interrupted(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn is_immediate_exit(&self) -> bool {
        self.immediate_exit.load(Ordering::SeqCst)
    }

    pub fn signal_count(&self) -> u8 {
        self.signal_count.load(Ordering::SeqCst)
    }

    /// Record one signal and return what the caller should do
    pub fn handle_signal(&self) -> SignalAction {
        match self.signal_count.fetch_add(1, Ordering::SeqCst) {
            0 => {
                self.flag.store(true, Ordering::SeqCst);
                SignalAction::Interrupt
            }
            1 => {
                self.immediate_exit.store(true, Ordering::SeqCst);
                SignalAction::ImmediateExit
            }
            _ => SignalAction::Ignore,
        }
    }
}

/// Install the process-wide handler. Must be called at most once.
pub fn install(state: Arc<InterruptState>) -> Result<(), ctrlc::Error> {
    ctrlc::set_handler(move || match state.handle_signal() {
        SignalAction::Interrupt => {
            warn!("interrupt received, stopping build");
        }
        SignalAction::ImmediateExit => {
            eprintln!("\nReceived second interrupt, exiting immediately...");
            std::process::exit(crate::summary::ExitCode::Interrupted.as_i32());
        }
        SignalAction::Ignore => {}
    })
}
