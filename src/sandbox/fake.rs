//! Scripted in-memory backend for orchestrator and worker tests, plus a
//! helper for standing in for the external tools the real backends drive

use std::collections::{HashSet, VecDeque};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{BackendError, ExecRequest, ExecutionOutcome, IsolationBackend, SandboxHandle};
use crate::core::submission::SourceFile;

/// Scripted reply to one `exec` call
pub enum Scripted {
    Outcome(ExecutionOutcome),
    Fail(String),
    /// Block until the cancellation token fires
    Hang,
}

#[derive(Default)]
struct State {
    next_id: u32,
    live: HashSet<String>,
    provisions: usize,
    destroys: usize,
    destroy_calls: usize,
    images: Vec<String>,
    written: Vec<SourceFile>,
    executed: Vec<ExecRequest>,
    script: VecDeque<Scripted>,
    fail_provision: bool,
    fail_write: bool,
}

#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<State>,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(replies: impl IntoIterator<Item = Scripted>) -> Self {
        let backend = Self::new();
        backend.state.lock().unwrap().script = replies.into_iter().collect();
        backend
    }

    pub fn failing_provision() -> Self {
        let backend = Self::new();
        backend.state.lock().unwrap().fail_provision = true;
        backend
    }

    pub fn failing_write() -> Self {
        let backend = Self::new();
        backend.state.lock().unwrap().fail_write = true;
        backend
    }

    pub fn provisions(&self) -> usize {
        self.state.lock().unwrap().provisions
    }

    /// Destroy calls that actually removed a live sandbox
    pub fn destroys(&self) -> usize {
        self.state.lock().unwrap().destroys
    }

    /// Every destroy call, including repeats on a removed sandbox
    pub fn destroy_calls(&self) -> usize {
        self.state.lock().unwrap().destroy_calls
    }

    pub fn live(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn images(&self) -> Vec<String> {
        self.state.lock().unwrap().images.clone()
    }

    pub fn written(&self) -> Vec<SourceFile> {
        self.state.lock().unwrap().written.clone()
    }

    pub fn executed(&self) -> Vec<ExecRequest> {
        self.state.lock().unwrap().executed.clone()
    }
}

#[async_trait]
impl IsolationBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn provision(&self, image: &str) -> Result<SandboxHandle, BackendError> {
        let mut state = self.state.lock().unwrap();
        state.images.push(image.to_string());
        if state.fail_provision {
            return Err(BackendError::Provision {
                image: image.to_string(),
                message: "image not found".to_string(),
            });
        }

        state.next_id += 1;
        state.provisions += 1;
        let id = format!("fake-{}", state.next_id);
        state.live.insert(id.clone());

        Ok(SandboxHandle {
            id,
            work_dir: "/sandbox".to_string(),
            image: image.to_string(),
        })
    }

    async fn write_files(
        &self,
        _handle: &SandboxHandle,
        files: &[SourceFile],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_write {
            return Err(BackendError::Command {
                action: "write file",
                message: "disk full".to_string(),
            });
        }
        state.written.extend(files.iter().cloned());
        Ok(())
    }

    async fn exec(
        &self,
        _handle: &SandboxHandle,
        request: &ExecRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionOutcome, BackendError> {
        let reply = {
            let mut state = self.state.lock().unwrap();
            state.executed.push(request.clone());
            state.script.pop_front()
        };

        match reply {
            Some(Scripted::Outcome(mut outcome)) => {
                outcome.phase = request.phase;
                Ok(outcome)
            }
            Some(Scripted::Fail(message)) => Err(BackendError::Command {
                action: "exec",
                message,
            }),
            Some(Scripted::Hang) => {
                cancel.cancelled().await;
                Err(BackendError::Cancelled)
            }
            None => Err(BackendError::Command {
                action: "exec",
                message: "no scripted reply left".to_string(),
            }),
        }
    }

    async fn destroy(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.destroy_calls += 1;
        if state.live.remove(&handle.id) {
            state.destroys += 1;
        }
        Ok(())
    }
}

/// Write an executable `sh` script into `dir`
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_destroy_twice_is_a_no_op() {
        let backend = FakeBackend::new();
        let handle = backend.provision("judge-sandbox-cpp:latest").await.unwrap();

        backend.destroy(&handle).await.unwrap();
        backend.destroy(&handle).await.unwrap();

        assert_eq!(backend.destroy_calls(), 2);
        assert_eq!(backend.destroys(), 1);
        assert_eq!(backend.live(), 0);
    }
}
