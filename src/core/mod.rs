//! Core judge types shared by the orchestrator, the classifier and the
//! isolation backends.

pub mod error;
pub mod limits;
pub mod submission;
pub mod verdict;

pub use error::JudgeError;
pub use limits::{LimitOverrides, LimitPolicy, ResourceLimits};
pub use submission::{SourceFile, Submission};
pub use verdict::Verdict;
