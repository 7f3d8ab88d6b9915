//! Docker backend
//!
//! Each sandbox is a long-lived, idle container started from the language
//! image with no network, no capabilities and memory/pids ceilings. Commands
//! run through `docker exec`, with limits enforced as follows:
//! - CPU time: RLIMIT_CPU inside the container (`ulimit -t`)
//! - Memory and process count: the container cgroup, adjusted per command
//! - Wall clock and output size: host side; a breach kills every process in
//!   the container except its init
//!
//! Resource usage comes from cgroup v2 counters read before and after the
//! command. Once an earlier command has set the container's memory peak,
//! `memory.current` is sampled while the command runs instead.

use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use nix::sys::signal::Signal;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::capture::{join_capture, spawn_capture};
use super::{
    BackendError, ExecRequest, ExecutionOutcome, ExitStatus, IsolationBackend, LimitKind,
    SandboxHandle,
};
use crate::core::submission::SourceFile;

/// Label put on every sandbox container (for out-of-band cleanup)
pub const SANDBOX_LABEL: &str = "sandbox-judge.sandbox=true";

/// Applies the CPU limit, then replaces the shell with the command
const CPU_LIMIT_WRAPPER: &str = r#"ulimit -t "$1"; shift; exec "$@""#;

/// Writes stdin to the given path, creating parent directories
const WRITE_FILE_SCRIPT: &str = r#"mkdir -p "$(dirname "$1")" && cat > "$1""#;

const CGROUP_STAT_FILES: [&str; 3] = [
    "/sys/fs/cgroup/cpu.stat",
    "/sys/fs/cgroup/memory.events",
    "/sys/fs/cgroup/memory.peak",
];

const MEMORY_CURRENT_FILE: &str = "/sys/fs/cgroup/memory.current";

/// Sampling period of `memory.current` while a command runs
const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(250);

/// How long to wait for the docker client after killing the sandboxed processes
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Docker backend configuration
#[derive(Debug, Clone)]
pub struct DockerConfig {
    /// Path to the docker CLI
    pub docker_bin: String,
    /// Working directory inside the image (must be writable by its user)
    pub work_dir: String,
    /// Container memory ceiling in MB
    pub memory_ceiling_mb: u64,
    /// Container process-count ceiling
    pub max_processes: u32,
    /// CPU quota (`--cpus`)
    pub cpus: String,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            work_dir: "/sandbox".to_string(),
            memory_ceiling_mb: 1024,
            max_processes: 128,
            cpus: "1".to_string(),
        }
    }
}

pub struct DockerBackend {
    config: DockerConfig,
}

/// cgroup v2 counters of a sandbox container
#[derive(Debug, Default, Clone, PartialEq)]
struct CgroupStats {
    cpu_usage_usec: Option<u64>,
    oom_kills: Option<u64>,
    memory_peak_bytes: Option<u64>,
}

fn parse_cgroup_stats(content: &str) -> CgroupStats {
    let mut stats = CgroupStats::default();

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("usage_usec"), Some(value)) => stats.cpu_usage_usec = value.parse().ok(),
            (Some("oom_kill"), Some(value)) => stats.oom_kills = value.parse().ok(),
            // memory.peak is a bare number
            (Some(value), None) => {
                if let Ok(bytes) = value.parse() {
                    stats.memory_peak_bytes = Some(bytes);
                }
            }
            _ => {}
        }
    }

    stats
}

fn is_missing_container(stderr: &str) -> bool {
    stderr.contains("No such container")
}

fn cpu_limit_secs(cpu_time_ms: u64) -> u64 {
    cpu_time_ms.div_ceil(1000).max(1)
}

/// Wait for the docker client, killing it if it does not exit in time
async fn reap(child: &mut Child) -> Result<std::process::ExitStatus, BackendError> {
    match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
        Ok(status) => Ok(status?),
        Err(_) => {
            child.kill().await?;
            Ok(child.wait().await?)
        }
    }
}

/// Track the highest `memory.current` of a container until `stop` fires
fn spawn_memory_sampler(
    docker_bin: String,
    container: String,
    stop: CancellationToken,
) -> JoinHandle<Option<u64>> {
    tokio::spawn(async move {
        let mut highest = None;
        let mut ticker = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let sample = Command::new(&docker_bin)
                .args(["exec", &container, "cat", MEMORY_CURRENT_FILE])
                .kill_on_drop(true)
                .output()
                .await;
            if let Ok(output) = sample {
                let bytes = String::from_utf8_lossy(&output.stdout).trim().parse::<u64>();
                if let (true, Ok(bytes)) = (output.status.success(), bytes) {
                    highest = highest.max(Some(bytes));
                }
            }
        }
        highest
    })
}

impl DockerBackend {
    pub fn new(config: DockerConfig) -> Self {
        Self { config }
    }

    fn command(&self) -> Command {
        Command::new(&self.config.docker_bin)
    }

    /// Ensure the docker daemon is reachable
    pub async fn ensure_available(&self) -> anyhow::Result<()> {
        let output = self
            .command()
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to run {}: {}", self.config.docker_bin, e))?;

        if !output.status.success() {
            anyhow::bail!(
                "Docker daemon is not available: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        info!(
            "Using docker server {}",
            String::from_utf8_lossy(&output.stdout).trim()
        );
        Ok(())
    }

    /// Run a docker subcommand to completion, returning its stdout
    async fn docker(&self, action: &'static str, args: &[String]) -> Result<String, BackendError> {
        let output = self.command().args(args).output().await?;
        if !output.status.success() {
            return Err(BackendError::Command {
                action,
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run_args(&self, image: &str, name: &str) -> Vec<String> {
        let memory = format!("{}m", self.config.memory_ceiling_mb);
        vec![
            "run".into(),
            "--detach".into(),
            "--pull".into(),
            "never".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            SANDBOX_LABEL.into(),
            "--network".into(),
            "none".into(),
            "--cap-drop".into(),
            "ALL".into(),
            "--security-opt".into(),
            "no-new-privileges".into(),
            "--cpus".into(),
            self.config.cpus.clone(),
            "--memory".into(),
            memory.clone(),
            "--memory-swap".into(),
            memory,
            "--pids-limit".into(),
            self.config.max_processes.to_string(),
            "--workdir".into(),
            self.config.work_dir.clone(),
            "--entrypoint".into(),
            "tail".into(),
            image.into(),
            "-f".into(),
            "/dev/null".into(),
        ]
    }

    fn exec_args(&self, handle: &SandboxHandle, request: &ExecRequest) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if request.stdin.is_some() {
            args.push("--interactive".to_string());
        }
        args.extend([
            "--workdir".to_string(),
            handle.work_dir.clone(),
            handle.id.clone(),
            "sh".to_string(),
            "-c".to_string(),
            CPU_LIMIT_WRAPPER.to_string(),
            "sandbox".to_string(),
            cpu_limit_secs(request.limits.cpu_time_ms).to_string(),
        ]);
        args.extend(request.command.iter().cloned());
        args
    }

    async fn update_limits(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
    ) -> Result<(), BackendError> {
        let memory = format!("{}m", request.limits.memory_mb);
        let args = vec![
            "update".to_string(),
            "--memory".to_string(),
            memory.clone(),
            "--memory-swap".to_string(),
            memory,
            "--pids-limit".to_string(),
            request.limits.processes.to_string(),
            handle.id.clone(),
        ];
        self.docker("docker update", &args).await.map(|_| ())
    }

    async fn read_cgroup_stats(&self, handle: &SandboxHandle) -> Result<CgroupStats, BackendError> {
        // A missing file (e.g. memory.peak on older kernels) fails `cat` but
        // still prints the others
        let output = self
            .command()
            .args(["exec", &handle.id, "cat"])
            .args(CGROUP_STAT_FILES)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(BackendError::Command {
                action: "read cgroup stats",
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(parse_cgroup_stats(&stdout))
    }

    /// Kill every sandboxed process but the container's init
    async fn kill_processes(&self, handle: &SandboxHandle) {
        let killed = self
            .command()
            .args(["exec", &handle.id, "kill", "-KILL", "-1"])
            .output()
            .await;

        // `kill -1` reports failure when nothing was left to kill; only a
        // failing `docker exec` (125-127, or no status) needs the fallback
        let exec_failed = match &killed {
            Ok(output) => !matches!(output.status.code(), Some(code) if code < 125),
            Err(_) => true,
        };
        if exec_failed {
            warn!(
                "Could not kill processes inside {}; stopping the container",
                handle.id
            );
            match self.command().args(["kill", &handle.id]).output().await {
                Ok(output) if output.status.success() => {}
                Ok(output) => warn!(
                    "Failed to stop container {}: {}",
                    handle.id,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(e) => warn!("Failed to stop container {}: {}", handle.id, e),
            }
        }
    }

    /// Force-remove a container; an already removed one is not an error
    async fn destroy_named(&self, container: &str) -> Result<(), BackendError> {
        let output = self
            .command()
            .args(["rm", "--force", container])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_container(&stderr) {
                debug!("Sandbox container {} already removed", container);
                return Ok(());
            }
            return Err(BackendError::Command {
                action: "docker rm",
                message: stderr.trim().to_string(),
            });
        }

        info!("Removed sandbox container {}", container);
        Ok(())
    }

    /// Fail unless the container is still running.
    ///
    /// Used to tell a failing `docker exec` from a program that failed with
    /// the same exit code; the program cannot fake the container's state.
    async fn ensure_running(&self, handle: &SandboxHandle, code: i32) -> Result<(), BackendError> {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            "{{.State.Running}}".to_string(),
            handle.id.clone(),
        ];
        match self.docker("docker inspect", &args).await {
            Ok(running) if running == "true" => Ok(()),
            Ok(running) => Err(BackendError::Command {
                action: "docker exec",
                message: format!(
                    "exit code {} and container {} is no longer running ({})",
                    code, handle.id, running
                ),
            }),
            Err(e) => Err(BackendError::Command {
                action: "docker exec",
                message: format!("exit code {} and {}", code, e),
            }),
        }
    }
}

#[async_trait]
impl IsolationBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn provision(&self, image: &str) -> Result<SandboxHandle, BackendError> {
        let name = format!("judge-{}", uuid::Uuid::new_v4().simple());
        let args = self.run_args(image, &name);
        debug!("Running docker with args: {:?}", args);

        let container_id = match self.docker("docker run", &args).await {
            Ok(id) => id,
            Err(e) => {
                // A container may exist even though it failed to start
                if let Err(cleanup) = self.destroy_named(&name).await {
                    warn!("Failed to clean up container {}: {}", name, cleanup);
                }
                let message = match e {
                    BackendError::Command { message, .. } => message,
                    other => other.to_string(),
                };
                return Err(BackendError::Provision {
                    image: image.to_string(),
                    message,
                });
            }
        };

        info!("Started sandbox container {} ({}) from {}", name, container_id, image);
        Ok(SandboxHandle {
            id: container_id,
            work_dir: self.config.work_dir.clone(),
            image: image.to_string(),
        })
    }

    async fn write_files(
        &self,
        handle: &SandboxHandle,
        files: &[SourceFile],
    ) -> Result<(), BackendError> {
        // Written by the image user so the toolchain can use the directory freely
        for file in files {
            let mut child = self
                .command()
                .args([
                    "exec",
                    "--interactive",
                    "--workdir",
                    &handle.work_dir,
                    &handle.id,
                    "sh",
                    "-c",
                    WRITE_FILE_SCRIPT,
                    "sandbox",
                    &file.path,
                ])
                .stdin(Stdio::piped())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()?;

            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(file.content.as_bytes()).await?;
                // Dropping stdin closes the pipe so `cat` sees EOF
            }

            let output = child.wait_with_output().await?;
            if !output.status.success() {
                return Err(BackendError::Command {
                    action: "write file",
                    message: format!(
                        "{}: {}",
                        file.path,
                        String::from_utf8_lossy(&output.stderr).trim()
                    ),
                });
            }
        }

        debug!("Wrote {} file(s) into {}", files.len(), handle.id);
        Ok(())
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, BackendError> {
        self.update_limits(handle, request).await?;
        let before = self.read_cgroup_stats(handle).await?;

        let args = self.exec_args(handle, request);
        debug!("Running docker with args: {:?}", args);

        let mut child = self
            .command()
            .args(&args)
            .stdin(if request.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let started = Instant::now();

        if let (Some(input), Some(mut stdin)) = (request.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                // The program may exit without reading all of its input
                let _ = stdin.write_all(input.as_bytes()).await;
            });
        }

        // After an earlier command the container-wide peak may already be
        // higher than anything this one reaches
        let stop_sampling = CancellationToken::new();
        let sampler = before.memory_peak_bytes.map(|_| {
            spawn_memory_sampler(
                self.config.docker_bin.clone(),
                handle.id.clone(),
                stop_sampling.clone(),
            )
        });

        let overflow = CancellationToken::new();
        let cap = request.limits.output_bytes;
        let stdout_task = spawn_capture(child.stdout.take(), cap, overflow.clone());
        let stderr_task = spawn_capture(child.stderr.take(), cap, overflow.clone());

        let wall_limit = Duration::from_millis(request.limits.wall_time_ms);
        let waited = tokio::select! {
            status = child.wait() => Ok(status?),
            _ = tokio::time::sleep(wall_limit) => Err(LimitKind::WallTime),
            _ = overflow.cancelled() => Err(LimitKind::Output),
            _ = cancel.cancelled() => {
                stop_sampling.cancel();
                self.kill_processes(handle).await;
                let _ = child.kill().await;
                return Err(BackendError::Cancelled);
            }
        };

        let (status, mut killed_by) = match waited {
            // Past the cap the capture closes its pipe, so the program may
            // die of SIGPIPE before the overflow is seen
            Ok(status) if overflow.is_cancelled() => (status, Some(LimitKind::Output)),
            Ok(status) => (status, None),
            Err(limit) => {
                debug!("{} exceeded {:?} limit; killing", handle.id, limit);
                self.kill_processes(handle).await;
                (reap(&mut child).await?, Some(limit))
            }
        };
        let wall_time_ms = started.elapsed().as_millis() as u64;
        stop_sampling.cancel();
        let sampled_bytes = match sampler {
            Some(task) => task.await.ok().flatten(),
            None => None,
        };

        let stdout = join_capture(stdout_task).await?;
        let stderr = join_capture(stderr_task).await?;

        let status = match status.code() {
            Some(code) => {
                if code != 0 && killed_by.is_none() {
                    self.ensure_running(handle, code).await?;
                }
                ExitStatus::from_shell_code(code)
            }
            None => ExitStatus::Signaled(status.signal().unwrap_or(Signal::SIGKILL as i32)),
        };

        let after = match self.read_cgroup_stats(handle).await {
            Ok(stats) => stats,
            Err(e) => {
                warn!("Could not read usage of {} after exec: {}", handle.id, e);
                CgroupStats::default()
            }
        };

        if killed_by.is_none() && after.oom_kills.unwrap_or(0) > before.oom_kills.unwrap_or(0) {
            killed_by = Some(LimitKind::Memory);
        }

        let mut outcome = ExecutionOutcome::new(request.phase, status);
        outcome.killed_by = killed_by;
        outcome.wall_time_ms = wall_time_ms;
        outcome.cpu_time_ms = match (before.cpu_usage_usec, after.cpu_usage_usec) {
            (Some(b), Some(a)) => a.saturating_sub(b) / 1000,
            _ => 0,
        };
        // The peak is container-wide: it belongs to this command only if the
        // command raised it, otherwise the sampled high-water mark stands in
        outcome.memory_kb = match (before.memory_peak_bytes, after.memory_peak_bytes) {
            (Some(b), Some(a)) if a > b => Some(a / 1024),
            (None, Some(a)) => Some(a / 1024),
            _ => sampled_bytes.map(|bytes| bytes / 1024),
        };
        outcome.stdout_truncated = stdout.truncated;
        outcome.stderr_truncated = stderr.truncated;
        outcome.stdout = stdout.into_string();
        outcome.stderr = stderr.into_string();

        Ok(outcome)
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        self.destroy_named(&handle.id).await
    }
}
