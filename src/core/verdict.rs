use serde::{Deserialize, Serialize};
use std::fmt;

/// Verdict from judging a single submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    OutputLimitExceeded,
    CompileError,
    InternalError,
}

impl Verdict {
    /// Whether the verdict was caused by the submission itself
    pub fn is_submission_outcome(&self) -> bool {
        !matches!(self, Verdict::InternalError)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verdict::Accepted => "accepted",
            Verdict::WrongAnswer => "wrong_answer",
            Verdict::RuntimeError => "runtime_error",
            Verdict::TimeLimitExceeded => "time_limit_exceeded",
            Verdict::MemoryLimitExceeded => "memory_limit_exceeded",
            Verdict::OutputLimitExceeded => "output_limit_exceeded",
            Verdict::CompileError => "compile_error",
            Verdict::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verdict_display() {
        assert_eq!(Verdict::Accepted.to_string(), "accepted");
        assert_eq!(Verdict::WrongAnswer.to_string(), "wrong_answer");
        assert_eq!(
            Verdict::OutputLimitExceeded.to_string(),
            "output_limit_exceeded"
        );
    }

    #[test]
    fn test_verdict_serde_matches_display() {
        let json = serde_json::to_string(&Verdict::TimeLimitExceeded).unwrap();
        assert_eq!(json, "\"time_limit_exceeded\"");

        let parsed: Verdict = serde_json::from_str("\"compile_error\"").unwrap();
        assert_eq!(parsed, Verdict::CompileError);
    }

    #[test]
    fn test_internal_error_is_not_a_submission_outcome() {
        assert!(!Verdict::InternalError.is_submission_outcome());
        assert!(Verdict::CompileError.is_submission_outcome());
    }
}
