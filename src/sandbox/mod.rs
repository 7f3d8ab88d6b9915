//! Sandbox module - Isolation backend abstraction
//!
//! This module defines the capability set the orchestrator consumes from an
//! isolation runtime:
//! - Provisioning an ephemeral sandbox from an image
//! - Writing submission files into its working directory
//! - Running a command under enforced limits, returning a raw outcome
//! - Tearing the sandbox down (idempotent)
//!
//! The sandbox module does NOT:
//! - Interpret verdicts (that's the classifier's job)
//! - Know about languages or compilation order
//! - Compare outputs

pub mod capture;
pub mod docker;
#[cfg(test)]
pub(crate) mod fake;
pub mod isolate;
pub mod meta;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::core::limits::ResourceLimits;
use crate::core::submission::SourceFile;

pub use docker::{DockerBackend, DockerConfig};
pub use isolate::IsolateBackend;

/// Errors raised by an isolation backend
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("cannot provision sandbox from {image}: {message}")]
    Provision { image: String, message: String },

    #[error("{action} failed: {message}")]
    Command {
        action: &'static str,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("execution cancelled")]
    Cancelled,
}

/// Reference to a live sandbox. Owned by exactly one orchestration run.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    /// Backend-specific identifier (container id, box id)
    pub id: String,
    /// Working directory inside the sandbox
    pub work_dir: String,
    /// Image the sandbox was provisioned from
    pub image: String,
}

/// Judging phase a command belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Compile,
    Run,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Compile => write!(f, "compile"),
            Phase::Run => write!(f, "run"),
        }
    }
}

/// Limit that made the backend terminate a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    WallTime,
    CpuTime,
    Memory,
    Output,
}

/// How the sandboxed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum ExitStatus {
    /// Exited normally with the given code
    Exited(i32),
    /// Terminated by the given signal
    Signaled(i32),
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// Decode a shell-style status where 128+N means "killed by signal N"
    pub fn from_shell_code(code: i32) -> Self {
        if code > 128 && code <= 128 + 64 {
            ExitStatus::Signaled(code - 128)
        } else {
            ExitStatus::Exited(code)
        }
    }
}

/// Command to execute inside a sandbox
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub phase: Phase,
    /// Program followed by its arguments
    pub command: Vec<String>,
    pub stdin: Option<String>,
    pub limits: ResourceLimits,
}

impl ExecRequest {
    pub fn new(phase: Phase, command: &[String], limits: ResourceLimits) -> Self {
        Self {
            phase,
            command: command.to_vec(),
            stdin: None,
            limits,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Raw outcome of one sandboxed command (no verdict interpretation)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub phase: Phase,
    pub status: ExitStatus,
    /// Set when the backend terminated the process for exceeding a limit
    pub killed_by: Option<LimitKind>,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// CPU time used in milliseconds
    pub cpu_time_ms: u64,
    /// Peak memory in KB, if the backend could observe it
    pub memory_kb: Option<u64>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl ExecutionOutcome {
    pub fn new(phase: Phase, status: ExitStatus) -> Self {
        Self {
            phase,
            status,
            killed_by: None,
            wall_time_ms: 0,
            cpu_time_ms: 0,
            memory_kb: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: false,
            stderr_truncated: false,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

/// Capability set of an isolation runtime
#[async_trait]
pub trait IsolationBackend: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Allocate an isolated environment from an image
    async fn provision(&self, image: &str) -> Result<SandboxHandle, BackendError>;

    /// Materialize files inside the sandbox working directory
    async fn write_files(
        &self,
        handle: &SandboxHandle,
        files: &[SourceFile],
    ) -> Result<(), BackendError>;

    /// Run a command under the request's limits.
    ///
    /// Must never block past the wall clock limit. A limit breach terminates
    /// the process tree and is reported through `killed_by`. Cancellation
    /// terminates the process tree and returns `BackendError::Cancelled`.
    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, BackendError>;

    /// Tear down the sandbox. Calling it on a destroyed handle is a no-op.
    ///
    /// Takes no cancellation token: it runs after a cancelled run and must
    /// complete. Implementations bound it themselves (a forced removal).
    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), BackendError>;
}
