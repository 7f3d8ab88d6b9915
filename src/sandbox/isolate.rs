//! Isolate backend
//!
//! Runs sandboxes as isolate boxes (Linux namespaces + cgroups) on the host.
//! The toolchain is the host's: the profile image reference is recorded on the
//! handle for logging only.
//!
//! See: https://github.com/ioi/isolate

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::fs;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capture::{join_capture, read_file_capped, spawn_capture};
use super::meta::{parse_meta, IsolateMeta, IsolateStatus};
use super::{
    BackendError, ExecRequest, ExecutionOutcome, ExitStatus, IsolationBackend, LimitKind, Phase,
    SandboxHandle,
};
use crate::core::submission::SourceFile;

const STDIN_FILE: &str = ".stdin.txt";
const STDOUT_FILE: &str = ".stdout.txt";
const STDERR_FILE: &str = ".stderr.txt";

/// Max file size for the compile phase, in KB (compiled binaries)
const COMPILE_FSIZE_KB: u64 = 262_144;

/// Isolate's own diagnostics kept for error messages
const ISOLATE_STDERR_BYTES: usize = 4096;

/// Grace period on top of isolate's own wall clock limit
const WALL_TIME_GRACE: Duration = Duration::from_secs(5);

/// Isolate only supports box IDs 0-9999; each worker (0-9) owns 1000 of them.
const BOXES_PER_WORKER: u32 = 1000;

pub struct IsolateBackend {
    isolate_bin: String,
    worker_id: u32,
    counter: AtomicU32,
}

impl IsolateBackend {
    pub fn new(worker_id: u32) -> Self {
        Self {
            isolate_bin: "isolate".to_string(),
            worker_id: worker_id % 10,
            counter: AtomicU32::new(0),
        }
    }

    /// Use a different isolate binary
    pub fn with_binary(mut self, isolate_bin: impl Into<String>) -> Self {
        self.isolate_bin = isolate_bin.into();
        self
    }

    /// Next box ID inside this worker's range
    fn next_box_id(&self) -> u32 {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        self.worker_id * BOXES_PER_WORKER + (counter % BOXES_PER_WORKER)
    }

    fn command(&self) -> Command {
        Command::new(&self.isolate_bin)
    }

    /// Ensure isolate with cgroup support is usable on this host
    pub async fn ensure_available(&self) -> anyhow::Result<()> {
        let check_id = (self.worker_id * BOXES_PER_WORKER + BOXES_PER_WORKER - 1).to_string();
        let init = self
            .command()
            .args(["--box-id", &check_id, "--cg", "--init"])
            .output()
            .await;

        let _ = self
            .command()
            .args(["--box-id", &check_id, "--cg", "--cleanup"])
            .output()
            .await;

        match init {
            Ok(output) if output.status.success() => Ok(()),
            Ok(output) => anyhow::bail!(
                "Isolate cgroup support is required but not available: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => anyhow::bail!("Failed to run {}: {}", self.isolate_bin, e),
        }
    }

    fn box_args(&self, request: &ExecRequest, box_id: &str, meta_file: &Path) -> Vec<String> {
        let limits = &request.limits;
        let time_limit_secs = limits.cpu_time_ms as f64 / 1000.0;
        let wall_time_secs = limits.wall_time_ms as f64 / 1000.0;
        let fsize_kb = match request.phase {
            Phase::Compile => COMPILE_FSIZE_KB,
            // Anything past the capture cap is discarded anyway
            Phase::Run => limits.output_bytes as u64 / 1024 + 1,
        };

        let mut args = vec![
            "--box-id".to_string(),
            box_id.to_string(),
            "--cg".to_string(),
            format!("--cg-mem={}", limits.memory_kb()),
            format!("--time={}", time_limit_secs),
            format!("--wall-time={}", wall_time_secs),
            format!("--meta={}", meta_file.display()),
            format!("--stdout={}", STDOUT_FILE),
            format!("--stderr={}", STDERR_FILE),
            format!("--processes={}", limits.processes),
            "--open-files=256".to_string(),
            format!("--fsize={}", fsize_kb),
            // Mount directories needed for toolchains and runtimes
            "--dir=/usr".to_string(),
            "--dir=/lib".to_string(),
            "--dir=/lib64".to_string(),
            "--dir=/etc:noexec".to_string(),
            "--dir=/tmp:tmp".to_string(),
            "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
            "--env=HOME=/box".to_string(),
        ];

        if request.stdin.is_some() {
            args.push(format!("--stdin={}", STDIN_FILE));
        }

        args.push("--run".to_string());
        args.push("--".to_string());

        // Prepend /usr/bin/ to the command if it's not an absolute or relative path
        let mut cmd_iter = request.command.iter();
        if let Some(cmd) = cmd_iter.next() {
            if cmd.starts_with('/') || cmd.starts_with("./") {
                args.push(cmd.clone());
            } else {
                args.push(format!("/usr/bin/{}", cmd));
            }
            args.extend(cmd_iter.cloned());
        }

        args
    }
}

/// Parse the meta file of a finished `isolate --run`.
///
/// Isolate writes the file on every run it manages to start. A missing file,
/// or a failing isolate that reports no status, means isolate itself broke.
fn checked_meta(
    content: &str,
    status: std::process::ExitStatus,
    isolate_stderr: &str,
) -> Result<IsolateMeta, BackendError> {
    if content.trim().is_empty() {
        return Err(BackendError::Command {
            action: "isolate --run",
            message: format!("no meta file written ({}): {}", status, isolate_stderr.trim()),
        });
    }

    let meta = parse_meta(content);
    if !status.success() && meta.status == IsolateStatus::Ok {
        return Err(BackendError::Command {
            action: "isolate --run",
            message: format!("{} without a run status: {}", status, isolate_stderr.trim()),
        });
    }
    Ok(meta)
}

/// Translate isolate's meta file into a raw outcome
fn outcome_from_meta(
    request: &ExecRequest,
    meta: &IsolateMeta,
) -> Result<ExecutionOutcome, BackendError> {
    let status = match meta.status {
        IsolateStatus::Ok | IsolateStatus::RuntimeError => ExitStatus::Exited(meta.exit_code),
        IsolateStatus::Signal(sig) => ExitStatus::Signaled(sig),
        IsolateStatus::TimeOut => ExitStatus::Signaled(Signal::SIGKILL as i32),
        IsolateStatus::InternalError => {
            return Err(BackendError::Command {
                action: "isolate --run",
                message: meta
                    .message
                    .clone()
                    .unwrap_or_else(|| "internal error".to_string()),
            })
        }
    };

    let memory_exceeded = meta.oom_killed
        || meta
            .memory_kb
            .map(|kb| kb > request.limits.memory_kb())
            .unwrap_or(false);

    let killed_by = if meta.status == IsolateStatus::TimeOut {
        Some(if meta.wall_timeout() {
            LimitKind::WallTime
        } else {
            LimitKind::CpuTime
        })
    } else if memory_exceeded {
        Some(LimitKind::Memory)
    } else if meta.status == IsolateStatus::Signal(Signal::SIGXFSZ as i32) {
        Some(LimitKind::Output)
    } else {
        None
    };

    let mut outcome = ExecutionOutcome::new(request.phase, status);
    outcome.killed_by = killed_by;
    outcome.cpu_time_ms = meta.time_ms;
    outcome.wall_time_ms = meta.wall_time_ms;
    outcome.memory_kb = meta.memory_kb;
    Ok(outcome)
}

#[async_trait]
impl IsolationBackend for IsolateBackend {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn provision(&self, image: &str) -> Result<SandboxHandle, BackendError> {
        let box_id = self.next_box_id().to_string();

        // Clean up any stale box with the same id
        let _ = self
            .command()
            .args(["--box-id", &box_id, "--cg", "--cleanup"])
            .output()
            .await;

        let output = self
            .command()
            .args(["--box-id", &box_id, "--cg", "--init"])
            .output()
            .await
            .map_err(|e| BackendError::Provision {
                image: image.to_string(),
                message: format!("failed to run isolate --init: {}", e),
            })?;

        if !output.status.success() {
            return Err(BackendError::Provision {
                image: image.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let box_path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!("Initialized isolate box {} at {} for {}", box_id, box_path, image);

        Ok(SandboxHandle {
            id: box_id,
            work_dir: format!("{}/box", box_path),
            image: image.to_string(),
        })
    }

    async fn write_files(
        &self,
        handle: &SandboxHandle,
        files: &[SourceFile],
    ) -> Result<(), BackendError> {
        let work_dir = Path::new(&handle.work_dir);
        for file in files {
            let dest = work_dir.join(&file.path);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::write(&dest, &file.content).await?;
        }
        debug!("Wrote {} file(s) into isolate box {}", files.len(), handle.id);
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, BackendError> {
        let work_dir = PathBuf::from(&handle.work_dir);
        let meta_file =
            std::env::temp_dir().join(format!("isolate_meta_{}_{}.txt", handle.id, request.phase));

        if let Some(stdin) = &request.stdin {
            fs::write(work_dir.join(STDIN_FILE), stdin).await?;
        }

        let args = self.box_args(request, &handle.id, &meta_file);
        debug!("Running isolate with args: {:?}", args);

        let mut child = self
            .command()
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stderr_task = spawn_capture(
            child.stderr.take(),
            ISOLATE_STDERR_BYTES,
            CancellationToken::new(),
        );

        let guard = Duration::from_millis(request.limits.wall_time_ms) + WALL_TIME_GRACE;
        let finished = tokio::select! {
            status = child.wait() => Some(status?),
            _ = tokio::time::sleep(guard) => None,
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = fs::remove_file(&meta_file).await;
                return Err(BackendError::Cancelled);
            }
        };

        let mut outcome = match finished {
            Some(status) => {
                let meta_content = fs::read_to_string(&meta_file).await.unwrap_or_default();
                let _ = fs::remove_file(&meta_file).await;
                let isolate_stderr = join_capture(stderr_task).await?.into_string();
                let meta = checked_meta(&meta_content, status, &isolate_stderr)?;
                outcome_from_meta(request, &meta)?
            }
            None => {
                warn!(
                    "isolate box {} did not finish within {:?}; killing",
                    handle.id, guard
                );
                let _ = child.kill().await;
                let _ = fs::remove_file(&meta_file).await;
                let mut outcome = ExecutionOutcome::new(
                    request.phase,
                    ExitStatus::Signaled(Signal::SIGKILL as i32),
                );
                outcome.killed_by = Some(LimitKind::WallTime);
                outcome.wall_time_ms = guard.as_millis() as u64;
                outcome
            }
        };

        let stdout = read_file_capped(&work_dir.join(STDOUT_FILE), request.limits.output_bytes)
            .await?;
        let stderr = read_file_capped(&work_dir.join(STDERR_FILE), request.limits.output_bytes)
            .await?;
        outcome.stdout_truncated = stdout.truncated;
        outcome.stderr_truncated = stderr.truncated;
        outcome.stdout = stdout.into_string();
        outcome.stderr = stderr.into_string();

        Ok(outcome)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        let output = self
            .command()
            .args(["--box-id", &handle.id, "--cg", "--cleanup"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(BackendError::Command {
                action: "isolate --cleanup",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!("Cleaned up isolate box {}", handle.id);
        Ok(())
    }
}
