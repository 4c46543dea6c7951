//! Resource estimates and budgets

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceSet {
    pub cpu: f64,
    pub memory_mb: f64,
    pub local_tests: f64,
}

impl ResourceSet {
    pub const ZERO: ResourceSet = ResourceSet {
        cpu: 0.0,
        memory_mb: 0.0,
        local_tests: 0.0,
    };

    pub fn new(cpu: f64, memory_mb: f64, local_tests: f64) -> Self {
        Self {
            cpu,
            memory_mb,
            local_tests,
        }
    }

    /// Every component is within `available`
    pub fn fits(&self, available: &ResourceSet) -> bool {
        self.cpu <= available.cpu
            && self.memory_mb <= available.memory_mb
            && self.local_tests <= available.local_tests
    }

    pub fn add(&self, other: &ResourceSet) -> ResourceSet {
        ResourceSet {
            cpu: self.cpu + other.cpu,
            memory_mb: self.memory_mb + other.memory_mb,
            local_tests: self.local_tests + other.local_tests,
        }
    }

    pub fn sub(&self, other: &ResourceSet) -> ResourceSet {
        ResourceSet {
            cpu: self.cpu - other.cpu,
            memory_mb: self.memory_mb - other.memory_mb,
            local_tests: self.local_tests - other.local_tests,
        }
    }

    /// Cap each component at `budget` so an oversized estimate can still run
    /// alone
    pub fn clamp_to(&self, budget: &ResourceSet) -> ResourceSet {
        ResourceSet {
            cpu: self.cpu.min(budget.cpu),
            memory_mb: self.memory_mb.min(budget.memory_mb),
            local_tests: self.local_tests.min(budget.local_tests),
        }
    }
}
