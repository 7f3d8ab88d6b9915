//! Sandboxed execution orchestrator for a programming-contest judge.
//!
//! A submission is resolved against the language registry, compiled and run
//! inside an isolated sandbox, classified into a verdict and torn down.

pub mod classifier;
pub mod config;
pub mod core;
pub mod languages;
pub mod orchestrator;
pub mod sandbox;
pub mod worker;

pub use crate::core::{JudgeError, Submission, Verdict};
pub use crate::orchestrator::{JudgeReport, Orchestrator, RunState};
