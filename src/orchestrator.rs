//! Execution orchestrator
//!
//! Drives one submission through `Pending -> Provisioned -> Compiled -> Ran ->
//! Finalized` (the compile step is skipped for interpreted languages), with
//! `Aborted` reachable from any non-terminal state.
//!
//! The sandbox is destroyed exactly once on every path that provisioned one:
//! success, compile error, backend failure and cancellation alike. Nothing is
//! retried here; transient infrastructure failures are the caller's policy.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{classify, compile_succeeded, LineComparator, OutputComparator};
use crate::core::error::JudgeError;
use crate::core::limits::{LimitPolicy, ResourceLimits};
use crate::core::submission::{SourceFile, Submission};
use crate::core::verdict::Verdict;
use crate::languages::{LanguageProfile, LanguageRegistry};
use crate::sandbox::{
    BackendError, ExecRequest, ExecutionOutcome, IsolationBackend, Phase, SandboxHandle,
};

/// Lifecycle state of one orchestration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Provisioned,
    Compiled,
    Ran,
    Finalized,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Finalized | RunState::Aborted)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Pending => "pending",
            RunState::Provisioned => "provisioned",
            RunState::Compiled => "compiled",
            RunState::Ran => "ran",
            RunState::Finalized => "finalized",
            RunState::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// Result of judging one submission
#[derive(Debug, Clone, Serialize)]
pub struct JudgeReport {
    pub verdict: Verdict,
    /// Phase at which judging stopped
    pub phase: Phase,
    /// Effective run-phase limits
    pub limits: ResourceLimits,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile: Option<ExecutionOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<ExecutionOutcome>,
}

impl JudgeReport {
    /// Outcome of the last executed phase
    pub fn final_outcome(&self) -> Option<&ExecutionOutcome> {
        self.run.as_ref().or(self.compile.as_ref())
    }

    pub fn stdout(&self) -> &str {
        self.final_outcome().map_or("", |o| o.stdout.as_str())
    }

    /// Program stderr, or compiler diagnostics on `CompileError`
    pub fn stderr(&self) -> &str {
        self.final_outcome().map_or("", |o| o.stderr.as_str())
    }

    pub fn cpu_time_ms(&self) -> u64 {
        self.final_outcome().map_or(0, |o| o.cpu_time_ms)
    }

    pub fn memory_kb(&self) -> Option<u64> {
        self.final_outcome().and_then(|o| o.memory_kb)
    }
}

pub struct Orchestrator {
    registry: Arc<LanguageRegistry>,
    backend: Arc<dyn IsolationBackend>,
    policy: LimitPolicy,
    comparator: Arc<dyn OutputComparator>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<LanguageRegistry>,
        backend: Arc<dyn IsolationBackend>,
        policy: LimitPolicy,
    ) -> Self {
        Self {
            registry,
            backend,
            policy,
            comparator: Arc::new(LineComparator),
        }
    }

    pub fn with_comparator(mut self, comparator: Arc<dyn OutputComparator>) -> Self {
        self.comparator = comparator;
        self
    }

    pub fn registry(&self) -> &LanguageRegistry {
        &self.registry
    }

    /// Judge one submission.
    ///
    /// Submission-caused failures come back as a report with a verdict.
    /// `Err` means the request was unusable, the judge is broken, or the run
    /// was cancelled.
    pub async fn judge(
        &self,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> Result<JudgeReport, JudgeError> {
        self.judge_with_state(submission, cancel).await.1
    }

    /// Like [`Orchestrator::judge`], also returning the terminal state of the
    /// run: `Finalized` with a report, `Aborted` with an error.
    pub async fn judge_with_state(
        &self,
        submission: &Submission,
        cancel: &CancellationToken,
    ) -> (RunState, Result<JudgeReport, JudgeError>) {
        let mut state = RunState::Pending;
        let result = self.run(submission, cancel, &mut state).await;
        if let Err(e) = &result {
            debug!("Run aborted from state {}: {}", state, e);
            state = RunState::Aborted;
        }
        (state, result)
    }

    async fn run(
        &self,
        submission: &Submission,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<JudgeReport, JudgeError> {
        // Nothing is provisioned until the request is known to be usable
        let profile = self.registry.resolve(&submission.language)?;
        let files = submission.materialize(profile)?;
        let limits = self
            .policy
            .effective_run_limits(&profile.limits, &submission.limits);

        if cancel.is_cancelled() {
            return Err(JudgeError::Cancelled(RunState::Pending));
        }

        let handle = self
            .backend
            .provision(&profile.image)
            .await
            .map_err(|source| {
                error!(
                    "Failed to provision {} sandbox from {}: {}",
                    self.backend.name(),
                    profile.image,
                    source
                );
                JudgeError::Provision {
                    image: profile.image.clone(),
                    source,
                }
            })?;
        info!(
            "Provisioned sandbox {} for {} ({})",
            handle.id, profile.id, profile.image
        );

        *state = RunState::Provisioned;
        let teardown = Teardown::new(Arc::clone(&self.backend), handle);
        let result = self
            .drive(teardown.handle(), profile, &files, limits, submission, cancel, state)
            .await;

        // Teardown runs on every exit path, before the result is inspected
        let id = teardown.release().await;

        match result {
            Ok(report) => {
                info!(
                    "Finalized {}: {} after {} phase ({}ms, {:?}KB)",
                    id,
                    report.verdict,
                    report.phase,
                    report.cpu_time_ms(),
                    report.memory_kb()
                );
                Ok(report)
            }
            Err(e) => {
                if e.is_infrastructure() {
                    error!("Aborted {} in state {}: {}", id, state, e);
                } else {
                    warn!("Aborted {} in state {}: {}", id, state, e);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        handle: &SandboxHandle,
        profile: &LanguageProfile,
        files: &[SourceFile],
        limits: ResourceLimits,
        submission: &Submission,
        cancel: &CancellationToken,
        state: &mut RunState,
    ) -> Result<JudgeReport, JudgeError> {
        let fail = |state: RunState, source: BackendError| match source {
            BackendError::Cancelled => JudgeError::Cancelled(state),
            source => JudgeError::Backend {
                state,
                image: handle.image.clone(),
                source,
            },
        };

        self.backend
            .write_files(handle, files)
            .await
            .map_err(|e| fail(*state, e))?;

        let mut compile = None;
        if let Some(command) = &profile.compile_command {
            check_cancelled(cancel, *state)?;

            let request = ExecRequest::new(Phase::Compile, command, self.policy.compile.clone());
            let outcome = self
                .backend
                .exec(handle, &request, cancel)
                .await
                .map_err(|e| fail(*state, e))?;

            if !compile_succeeded(&outcome) {
                debug!(
                    "Compilation failed in {}: {:?} (killed by {:?})",
                    handle.id, outcome.status, outcome.killed_by
                );
                *state = RunState::Finalized;
                return Ok(JudgeReport {
                    verdict: Verdict::CompileError,
                    phase: Phase::Compile,
                    limits,
                    compile: Some(outcome),
                    run: None,
                });
            }

            *state = RunState::Compiled;
            compile = Some(outcome);
        }

        check_cancelled(cancel, *state)?;

        let request = ExecRequest::new(Phase::Run, &profile.run_command, limits.clone())
            .with_stdin(submission.stdin.clone());
        let outcome = self
            .backend
            .exec(handle, &request, cancel)
            .await
            .map_err(|e| fail(*state, e))?;
        *state = RunState::Ran;

        let expected = submission
            .expected_output
            .as_deref()
            .map(|expected| (expected, self.comparator.as_ref()));
        let verdict = classify(&outcome, &limits, expected);

        *state = RunState::Finalized;
        Ok(JudgeReport {
            verdict,
            phase: Phase::Run,
            limits,
            compile,
            run: Some(outcome),
        })
    }
}

/// Owns a provisioned sandbox until it is destroyed.
///
/// `release` is the teardown on every path the run returns through. A run
/// dropped before that point (its task aborted, a panic unwinding) still gets
/// its sandbox destroyed in the background.
struct Teardown {
    backend: Arc<dyn IsolationBackend>,
    handle: SandboxHandle,
    armed: bool,
}

impl Teardown {
    fn new(backend: Arc<dyn IsolationBackend>, handle: SandboxHandle) -> Self {
        Self {
            backend,
            handle,
            armed: true,
        }
    }

    fn handle(&self) -> &SandboxHandle {
        &self.handle
    }

    /// Destroy the sandbox, returning its id for logging
    async fn release(mut self) -> String {
        if let Err(e) = self.backend.destroy(&self.handle).await {
            warn!("Failed to destroy sandbox {}: {}", self.handle.id, e);
        }
        self.armed = false;
        self.handle.id.clone()
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let handle = self.handle.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                warn!("Run for sandbox {} dropped; destroying it in the background", handle.id);
                runtime.spawn(async move {
                    if let Err(e) = backend.destroy(&handle).await {
                        warn!("Failed to destroy sandbox {}: {}", handle.id, e);
                    }
                });
            }
            Err(_) => error!("No runtime left to destroy sandbox {}", handle.id),
        }
    }
}

fn check_cancelled(cancel: &CancellationToken, state: RunState) -> Result<(), JudgeError> {
    if cancel.is_cancelled() {
        return Err(JudgeError::Cancelled(state));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::limits::LimitOverrides;
    use crate::sandbox::fake::{FakeBackend, Scripted};
    use crate::sandbox::{ExitStatus, LimitKind};
    use tokio_test::{assert_err, assert_ok};

    const LANGUAGES: &str = r#"
[cpp]
image = "judge-sandbox-cpp:latest"
source_file = "main.cpp"
compile_command = "g++ -O2 -o main {source}"
run_command = "./main"
time_limit_ms = 2000
memory_limit_mb = 256

[python]
image = "judge-sandbox-python:latest"
source_file = "main.py"
run_command = "python3 {source}"
time_limit_ms = 5000
memory_limit_mb = 256
"#;

    fn orchestrator(backend: Arc<FakeBackend>) -> Orchestrator {
        let registry = Arc::new(LanguageRegistry::from_toml_str(LANGUAGES).unwrap());
        Orchestrator::new(registry, backend, LimitPolicy::default())
    }

    fn exited(code: i32) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::new(Phase::Run, ExitStatus::Exited(code));
        outcome.cpu_time_ms = 5;
        outcome.wall_time_ms = 8;
        outcome
    }

    fn printed(stdout: &str) -> ExecutionOutcome {
        let mut outcome = exited(0);
        outcome.stdout = stdout.to_string();
        outcome
    }

    fn cpp(source: &str) -> Submission {
        Submission::new("cpp", source)
    }

    #[tokio::test]
    async fn test_accepted() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(printed("2\n")),
        ]));
        let report = assert_ok!(
            orchestrator(backend.clone())
                .judge(
                    &cpp("int main(){}").with_expected_output("2"),
                    &CancellationToken::new(),
                )
                .await
        );

        assert_eq!(report.verdict, Verdict::Accepted);
        assert_eq!(report.phase, Phase::Run);
        assert_eq!(report.stdout(), "2\n");
        assert!(report.compile.is_some());
        assert_eq!(backend.provisions(), 1);
        assert_eq!(backend.destroys(), 1);
        assert_eq!(backend.destroy_calls(), 1);
        assert_eq!(backend.live(), 0);
        assert_eq!(backend.images(), vec!["judge-sandbox-cpp:latest"]);

        let executed = backend.executed();
        assert_eq!(executed.len(), 2);
        assert_eq!(executed[0].phase, Phase::Compile);
        assert_eq!(executed[1].command, vec!["./main"]);
    }

    #[tokio::test]
    async fn test_source_is_written_to_profile_file() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(exited(0)),
        ]));
        orchestrator(backend.clone())
            .judge(&cpp("int main(){}"), &CancellationToken::new())
            .await
            .unwrap();

        let written = backend.written();
        assert_eq!(written, vec![SourceFile::new("main.cpp", "int main(){}")]);
    }

    #[tokio::test]
    async fn test_wrong_answer() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(printed("3\n")),
        ]));
        let report = orchestrator(backend.clone())
            .judge(&cpp("x").with_expected_output("2\n"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::WrongAnswer);
        assert_eq!(backend.destroys(), 1);
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn test_compile_error_never_runs() {
        let mut failed = exited(1);
        failed.stderr = "main.cpp:1:1: error: expected ';'".to_string();
        let backend = Arc::new(FakeBackend::scripted([Scripted::Outcome(failed)]));

        let report = orchestrator(backend.clone())
            .judge(&cpp("int main() {"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::CompileError);
        assert_eq!(report.phase, Phase::Compile);
        assert!(report.run.is_none());
        assert!(report.stderr().contains("error"));
        assert_eq!(backend.executed().len(), 1);
        assert_eq!(backend.destroys(), 1);
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn test_compile_uses_policy_limits() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(exited(0)),
        ]));
        orchestrator(backend.clone())
            .judge(&cpp("x"), &CancellationToken::new())
            .await
            .unwrap();

        let executed = backend.executed();
        assert_eq!(executed[0].limits, LimitPolicy::default().compile);
        assert_eq!(executed[0].stdin, None);
        assert_eq!(executed[1].limits.cpu_time_ms, 2000);
    }

    #[tokio::test]
    async fn test_interpreted_language_skips_compile() {
        let backend = Arc::new(FakeBackend::scripted([Scripted::Outcome(printed("hi\n"))]));
        let submission = Submission::new("py", "print('hi')").with_stdin("ignored\n");
        let report = orchestrator(backend.clone())
            .judge(&submission, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.verdict, Verdict::Accepted);
        assert!(report.compile.is_none());

        let executed = backend.executed();
        assert_eq!(executed.len(), 1);
        assert_eq!(executed[0].command, vec!["python3", "main.py"]);
        assert_eq!(executed[0].stdin.as_deref(), Some("ignored\n"));
    }

    #[tokio::test]
    async fn test_unsupported_language_provisions_nothing() {
        let backend = Arc::new(FakeBackend::new());
        let err = assert_err!(
            orchestrator(backend.clone())
                .judge(
                    &Submission::new("brainfuck", "+++"),
                    &CancellationToken::new(),
                )
                .await
        );

        assert!(matches!(err, JudgeError::UnsupportedLanguage(ref l) if l == "brainfuck"));
        assert_eq!(backend.images().len(), 0);
        assert_eq!(backend.provisions(), 0);
    }

    #[tokio::test]
    async fn test_invalid_submission_provisions_nothing() {
        let backend = Arc::new(FakeBackend::new());
        let submission = Submission::with_files(
            "cpp",
            vec![SourceFile::new("../escape.cpp", "int main(){}")],
        );
        let err = orchestrator(backend.clone())
            .judge(&submission, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JudgeError::InvalidSubmission(_)));
        assert_eq!(backend.images().len(), 0);
    }

    #[tokio::test]
    async fn test_provision_failure_is_internal_error() {
        let backend = Arc::new(FakeBackend::failing_provision());
        let err = orchestrator(backend.clone())
            .judge(&cpp("x"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, JudgeError::Provision { ref image, .. } if image == "judge-sandbox-cpp:latest"));
        assert_eq!(err.verdict(), Some(Verdict::InternalError));
        assert_eq!(backend.destroys(), 0);
        assert_eq!(backend.destroy_calls(), 0);
        assert!(backend.executed().is_empty());
    }

    #[tokio::test]
    async fn test_write_failure_still_destroys() {
        let backend = Arc::new(FakeBackend::failing_write());
        let err = orchestrator(backend.clone())
            .judge(&cpp("x"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            JudgeError::Backend {
                state: RunState::Provisioned,
                ..
            }
        ));
        assert_eq!(backend.destroys(), 1);
        assert_eq!(backend.destroy_calls(), 1);
        assert_eq!(backend.live(), 0);
        assert!(backend.executed().is_empty());
    }

    #[tokio::test]
    async fn test_exec_failure_during_run_destroys() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Fail("daemon went away".to_string()),
        ]));
        let err = orchestrator(backend.clone())
            .judge(&cpp("x"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            JudgeError::Backend {
                state: RunState::Compiled,
                ..
            }
        ));
        assert!(err.is_infrastructure());
        assert_eq!(backend.destroys(), 1);
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_run_destroys() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Hang,
        ]));
        let orchestrator = orchestrator(backend.clone());
        let cancel = CancellationToken::new();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let (state, result) = orchestrator.judge_with_state(&cpp("x"), &cancel).await;
        canceller.await.unwrap();
        let err = result.unwrap_err();

        assert_eq!(state, RunState::Aborted);
        assert!(matches!(err, JudgeError::Cancelled(RunState::Compiled)));
        assert_eq!(err.verdict(), None);
        assert_eq!(backend.destroys(), 1);
        assert_eq!(backend.destroy_calls(), 1);
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_provisions_nothing() {
        let backend = Arc::new(FakeBackend::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator(backend.clone())
            .judge(&cpp("x"), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, JudgeError::Cancelled(RunState::Pending)));
        assert_eq!(backend.provisions(), 0);
    }

    #[tokio::test]
    async fn test_cpu_limit_exceeded_with_clean_exit() {
        let mut slow = exited(0);
        slow.cpu_time_ms = 2500;
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(slow),
        ]));

        let report = orchestrator(backend.clone())
            .judge(&cpp("x"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.verdict, Verdict::TimeLimitExceeded);
    }

    #[tokio::test]
    async fn test_memory_kill_beats_exit_code() {
        let mut oom = ExecutionOutcome::new(Phase::Run, ExitStatus::Signaled(9));
        oom.killed_by = Some(LimitKind::Memory);
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(oom),
        ]));

        let report = orchestrator(backend.clone())
            .judge(&cpp("x"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.verdict, Verdict::MemoryLimitExceeded);
        assert_eq!(backend.destroys(), 1);
        assert_eq!(backend.destroy_calls(), 1);
    }

    #[tokio::test]
    async fn test_truncated_output_is_ole() {
        let mut flood = printed("yyyy");
        flood.stdout_truncated = true;
        flood.killed_by = Some(LimitKind::Output);
        let backend = Arc::new(FakeBackend::scripted([Scripted::Outcome(flood)]));

        let report = orchestrator(backend.clone())
            .judge(&Submission::new("python", "x"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.verdict, Verdict::OutputLimitExceeded);
    }

    #[tokio::test]
    async fn test_overrides_are_clamped_to_ceiling() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(exited(0)),
        ]));
        let overrides = LimitOverrides {
            cpu_time_ms: Some(60_000),
            memory_mb: Some(64),
            ..Default::default()
        };
        let report = orchestrator(backend.clone())
            .judge(&cpp("x").with_limits(overrides), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.limits.cpu_time_ms, 10_000);
        assert_eq!(report.limits.memory_mb, 64);
        assert_eq!(backend.executed()[1].limits, report.limits);
    }

    #[tokio::test]
    async fn test_concurrent_runs_share_nothing() {
        let replies = (0..8).map(|_| Scripted::Outcome(exited(0)));
        let backend = Arc::new(FakeBackend::scripted(replies));
        let orchestrator = Arc::new(orchestrator(backend.clone()));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let orchestrator = Arc::clone(&orchestrator);
            tasks.spawn(async move {
                orchestrator
                    .judge(&cpp("x"), &CancellationToken::new())
                    .await
                    .unwrap()
                    .verdict
            });
        }
        while let Some(verdict) = tasks.join_next().await {
            assert_eq!(verdict.unwrap(), Verdict::Accepted);
        }

        assert_eq!(backend.provisions(), 4);
        assert_eq!(backend.destroys(), 4);
        assert_eq!(backend.destroy_calls(), 4);
        assert_eq!(backend.live(), 0);
    }

    #[tokio::test]
    async fn test_terminal_states() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(exited(0)),
            Scripted::Outcome(exited(1)),
        ]));
        let orchestrator = orchestrator(backend.clone());
        let cancel = CancellationToken::new();

        let (state, result) = orchestrator.judge_with_state(&cpp("x"), &cancel).await;
        assert_eq!(state, RunState::Finalized);
        assert_ok!(result);

        let (state, result) = orchestrator.judge_with_state(&cpp("x"), &cancel).await;
        assert_eq!(state, RunState::Finalized);
        assert_eq!(result.unwrap().verdict, Verdict::CompileError);

        let (state, result) = orchestrator
            .judge_with_state(&Submission::new("cobol", "x"), &cancel)
            .await;
        assert_eq!(state, RunState::Aborted);
        assert_err!(result);

        assert_eq!(backend.destroy_calls(), 2);
    }

    #[tokio::test]
    async fn test_dropped_run_still_destroys() {
        let backend = Arc::new(FakeBackend::scripted([
            Scripted::Outcome(exited(0)),
            Scripted::Hang,
        ]));
        let orchestrator = orchestrator(backend.clone());
        let cancel = CancellationToken::new();

        // The run hangs in exec until the timeout drops it
        let abandoned = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            orchestrator.judge(&cpp("x"), &cancel),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(backend.provisions(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(backend.destroy_calls(), 1);
        assert_eq!(backend.live(), 0);
    }

    #[test]
    fn test_run_state_display() {
        assert_eq!(RunState::Compiled.to_string(), "compiled");
        assert!(RunState::Aborted.is_terminal());
        assert!(!RunState::Ran.is_terminal());
    }
}
