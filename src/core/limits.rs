//! Resource limits
//!
//! Limits applied to a single sandboxed command, plus the policy that turns
//! profile defaults and per-submission overrides into effective limits.

use serde::{Deserialize, Serialize};

/// Wall time = 2x CPU time + 1s buffer
pub fn derive_wall_time_ms(cpu_time_ms: u64) -> u64 {
    cpu_time_ms.saturating_mul(2).saturating_add(1000)
}

/// Resource limits for one sandboxed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// CPU time limit in milliseconds
    pub cpu_time_ms: u64,
    /// Wall clock limit in milliseconds
    pub wall_time_ms: u64,
    /// Memory limit in MB
    pub memory_mb: u64,
    /// Maximum captured bytes per output stream
    pub output_bytes: usize,
    /// Maximum number of processes
    pub processes: u32,
}

impl ResourceLimits {
    pub fn new(cpu_time_ms: u64, memory_mb: u64, output_bytes: usize) -> Self {
        Self {
            cpu_time_ms,
            wall_time_ms: derive_wall_time_ms(cpu_time_ms),
            memory_mb,
            output_bytes,
            processes: 64,
        }
    }

    pub fn with_processes(mut self, processes: u32) -> Self {
        self.processes = processes;
        self
    }

    pub fn memory_kb(&self) -> u64 {
        self.memory_mb.saturating_mul(1024)
    }

    /// Field-wise minimum of two limit sets
    pub fn clamp_to(&self, ceiling: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            cpu_time_ms: self.cpu_time_ms.min(ceiling.cpu_time_ms),
            wall_time_ms: self.wall_time_ms.min(ceiling.wall_time_ms),
            memory_mb: self.memory_mb.min(ceiling.memory_mb),
            output_bytes: self.output_bytes.min(ceiling.output_bytes),
            processes: self.processes.min(ceiling.processes),
        }
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self::new(1000, 256, 1024 * 1024)
    }
}

/// Per-submission limit overrides. Missing fields fall back to the profile.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_bytes: Option<usize>,
}

impl LimitOverrides {
    pub fn is_empty(&self) -> bool {
        self == &LimitOverrides::default()
    }
}

/// Judge-wide limit policy
#[derive(Debug, Clone)]
pub struct LimitPolicy {
    /// Limits for the compile phase (independent of the submission, never
    /// above `ceiling` for time or memory)
    pub compile: ResourceLimits,
    /// Upper bound for any run-phase limit
    pub ceiling: ResourceLimits,
}

impl LimitPolicy {
    /// Effective run limits: min(requested or profile default, ceiling).
    ///
    /// When only the CPU limit is overridden the wall clock limit is
    /// re-derived from it.
    pub fn effective_run_limits(
        &self,
        defaults: &ResourceLimits,
        overrides: &LimitOverrides,
    ) -> ResourceLimits {
        let cpu_time_ms = overrides.cpu_time_ms.unwrap_or(defaults.cpu_time_ms);
        let wall_time_ms = match (overrides.wall_time_ms, overrides.cpu_time_ms) {
            (Some(wall), _) => wall,
            (None, Some(cpu)) => derive_wall_time_ms(cpu),
            (None, None) => defaults.wall_time_ms,
        };

        let requested = ResourceLimits {
            cpu_time_ms,
            wall_time_ms,
            memory_mb: overrides.memory_mb.unwrap_or(defaults.memory_mb),
            output_bytes: overrides.output_bytes.unwrap_or(defaults.output_bytes),
            processes: defaults.processes,
        };

        requested.clamp_to(&self.ceiling)
    }
}

impl Default for LimitPolicy {
    fn default() -> Self {
        Self {
            compile: ResourceLimits::new(8_000, 512, 64 * 1024).with_processes(128),
            ceiling: ResourceLimits::new(10_000, 1024, 8 * 1024 * 1024),
        }
    }
}
