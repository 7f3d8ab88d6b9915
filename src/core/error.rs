//! Errors surfaced to the caller of an orchestration run
//!
//! Submission-caused failures are verdicts, not errors. Everything here is
//! either a caller/configuration problem or a broken judge.

use crate::core::verdict::Verdict;
use crate::orchestrator::RunState;
use crate::sandbox::BackendError;

#[derive(Debug, thiserror::Error)]
pub enum JudgeError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid submission: {0}")]
    InvalidSubmission(String),

    #[error("failed to provision sandbox from image {image}: {source}")]
    Provision {
        image: String,
        #[source]
        source: BackendError,
    },

    #[error("sandbox failure in state {state} (image {image}): {source}")]
    Backend {
        state: RunState,
        image: String,
        #[source]
        source: BackendError,
    },

    #[error("judging cancelled in state {0}")]
    Cancelled(RunState),
}

impl JudgeError {
    /// Verdict to report for this error, if it stands for one.
    ///
    /// Infrastructure failures are reported as `InternalError`; caller and
    /// configuration errors and cancellations carry no verdict.
    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            JudgeError::Provision { .. } | JudgeError::Backend { .. } => {
                Some(Verdict::InternalError)
            }
            JudgeError::UnsupportedLanguage(_)
            | JudgeError::InvalidSubmission(_)
            | JudgeError::Cancelled(_) => None,
        }
    }

    /// Whether the failure comes from the judge infrastructure
    pub fn is_infrastructure(&self) -> bool {
        self.verdict().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infrastructure_errors_map_to_internal_error() {
        let err = JudgeError::Provision {
            image: "judge-sandbox-cpp:latest".to_string(),
            source: BackendError::Provision {
                image: "judge-sandbox-cpp:latest".to_string(),
                message: "no such image".to_string(),
            },
        };
        assert_eq!(err.verdict(), Some(Verdict::InternalError));
        assert!(err.is_infrastructure());
    }

    #[test]
    fn test_caller_errors_have_no_verdict() {
        assert_eq!(
            JudgeError::UnsupportedLanguage("brainfuck".into()).verdict(),
            None
        );
        assert_eq!(
            JudgeError::Cancelled(RunState::Provisioned).verdict(),
            None
        );
    }

    #[test]
    fn test_error_message_names_state_and_image() {
        let err = JudgeError::Backend {
            state: RunState::Compiled,
            image: "judge-sandbox-cpp:latest".to_string(),
            source: BackendError::Command {
                action: "docker exec",
                message: "daemon unreachable".to_string(),
            },
        };
        let message = err.to_string();
        assert!(message.contains("compiled"));
        assert!(message.contains("judge-sandbox-cpp:latest"));
    }
}
