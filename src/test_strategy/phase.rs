//! Test execution phases

use std::fmt;

/// Phases of one test execution, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestPhase {
    PreparingRunfiles,
    Spawning,
    Running,
    CollectingResult,
    Finalized,
}

impl TestPhase {
    /// Check if transition to target phase is valid
    pub fn can_transition_to(&self, target: TestPhase) -> bool {
        matches!(
            (self, target),
            (TestPhase::PreparingRunfiles, TestPhase::Spawning)
                | (TestPhase::Spawning, TestPhase::Running)
                | (TestPhase::Running, TestPhase::CollectingResult)
                | (TestPhase::CollectingResult, TestPhase::Finalized)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TestPhase::Finalized)
    }
}

impl fmt::Display for TestPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestPhase::PreparingRunfiles => "preparing-runfiles",
            TestPhase::Spawning => "spawning",
            TestPhase::Running => "running",
            TestPhase::CollectingResult => "collecting-result",
            TestPhase::Finalized => "finalized",
        };
        f.write_str(name)
    }
}

/// Current phase of a test, advanced strictly in order
#[derive(Debug)]
pub struct PhaseTracker {
    phase: TestPhase,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            phase: TestPhase::PreparingRunfiles,
        }
    }

    pub fn phase(&self) -> TestPhase {
        self.phase
    }

    pub fn advance(&mut self, to: TestPhase) -> Result<(), String> {
        if !self.phase.can_transition_to(to) {
            return Err(format!("illegal test phase transition {} -> {to}", self.phase));
        }
        self.phase = to;
        Ok(())
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases_advance_in_order() {
        let mut tracker = PhaseTracker::new();
        for phase in [
            TestPhase::Spawning,
            TestPhase::Running,
            TestPhase::CollectingResult,
            TestPhase::Finalized,
        ] {
            tracker.advance(phase).unwrap();
        }
        assert!(tracker.phase().is_terminal());
    }

    #[test]
    fn test_skipping_a_phase_is_rejected() {
        let mut tracker = PhaseTracker::new();
        let err = tracker.advance(TestPhase::Running).unwrap_err();
        assert_eq!(err, "illegal test phase transition preparing-runfiles -> running");
        assert_eq!(tracker.phase(), TestPhase::PreparingRunfiles);
    }

    #[test]
    fn test_finalized_is_terminal() {
        assert!(!TestPhase::Finalized.can_transition_to(TestPhase::PreparingRunfiles));
    }
}
