//! Result classifier
//!
//! Deterministic mapping from a raw `ExecutionOutcome` to a `Verdict`.
//! A limit violation always wins over the exit status, so a process that was
//! killed for memory and also exited non-zero is `MemoryLimitExceeded`.

use nix::sys::signal::Signal;

use crate::core::limits::ResourceLimits;
use crate::core::verdict::Verdict;
use crate::sandbox::{ExecutionOutcome, ExitStatus, LimitKind};

/// Decides whether program output matches the expected answer
pub trait OutputComparator: Send + Sync {
    fn matches(&self, actual: &str, expected: &str) -> bool;
}

/// Line-based comparison ignoring trailing whitespace on each line and
/// trailing blank lines
#[derive(Debug, Default, Clone, Copy)]
pub struct LineComparator;

impl OutputComparator for LineComparator {
    fn matches(&self, actual: &str, expected: &str) -> bool {
        fn normalize(s: &str) -> Vec<&str> {
            let mut lines: Vec<&str> = s.lines().map(str::trim_end).collect();
            while lines.last().is_some_and(|line| line.is_empty()) {
                lines.pop();
            }
            lines
        }

        normalize(actual) == normalize(expected)
    }
}

/// Byte-for-byte comparison
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactComparator;

impl OutputComparator for ExactComparator {
    fn matches(&self, actual: &str, expected: &str) -> bool {
        actual == expected
    }
}

fn limit_verdict(kind: LimitKind) -> Verdict {
    match kind {
        LimitKind::WallTime | LimitKind::CpuTime => Verdict::TimeLimitExceeded,
        LimitKind::Memory => Verdict::MemoryLimitExceeded,
        LimitKind::Output => Verdict::OutputLimitExceeded,
    }
}

/// Limit breach observed on an outcome, whether or not the backend killed it
fn observed_limit(outcome: &ExecutionOutcome, limits: &ResourceLimits) -> Option<LimitKind> {
    if let Some(kind) = outcome.killed_by {
        return Some(kind);
    }

    let signal = match outcome.status {
        ExitStatus::Signaled(sig) => Some(sig),
        ExitStatus::Exited(_) => None,
    };

    if outcome.cpu_time_ms > limits.cpu_time_ms || signal == Some(Signal::SIGXCPU as i32) {
        return Some(LimitKind::CpuTime);
    }
    if outcome.wall_time_ms > limits.wall_time_ms {
        return Some(LimitKind::WallTime);
    }
    if outcome
        .memory_kb
        .is_some_and(|used| used > limits.memory_kb())
    {
        return Some(LimitKind::Memory);
    }
    if outcome.is_truncated() || signal == Some(Signal::SIGXFSZ as i32) {
        return Some(LimitKind::Output);
    }
    None
}

/// Classify a run-phase outcome.
///
/// `expected` pairs the expected output with the comparator to use; without
/// it a clean exit alone is `Accepted`.
pub fn classify(
    outcome: &ExecutionOutcome,
    limits: &ResourceLimits,
    expected: Option<(&str, &dyn OutputComparator)>,
) -> Verdict {
    if let Some(kind) = observed_limit(outcome, limits) {
        return limit_verdict(kind);
    }

    if !outcome.status.is_success() {
        return Verdict::RuntimeError;
    }

    match expected {
        Some((expected, comparator)) if !comparator.matches(&outcome.stdout, expected) => {
            Verdict::WrongAnswer
        }
        _ => Verdict::Accepted,
    }
}

/// Whether a compile-phase outcome produced a usable program
pub fn compile_succeeded(outcome: &ExecutionOutcome) -> bool {
    outcome.status.is_success() && outcome.killed_by.is_none()
}
