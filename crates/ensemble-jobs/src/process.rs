// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Executor that runs one worker process per task.
//!
//! The worker receives the [`WorkSpec`] as JSON on stdin (also written to
//! `workspec.json` in the job workspace, with the workspace as its working
//! directory) and must print a JSON array of trajectories on stdout before
//! exiting with status 0.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use ensemble_cache::Trajectory;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::executor::{Executor, ExecutorError, TaskHandle, WorkSpec};

/// File the work spec is written to inside the job workspace.
pub const WORKSPEC_FILE: &str = "workspec.json";

const STDERR_TAIL: usize = 512;

/// Worker command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments passed before anything else.
    #[serde(default)]
    pub args: Vec<String>,
}

/// [`Executor`] backed by local child processes.
pub struct ProcessExecutor {
    command: WorkerCommand,
    tasks: Mutex<HashMap<TaskHandle, Child>>,
}

impl ProcessExecutor {
    /// Executor running `command` for every task.
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Tasks submitted but not yet awaited or cancelled.
    pub fn pending(&self) -> usize {
        self.lock_tasks().len()
    }

    fn lock_tasks(&self) -> MutexGuard<'_, HashMap<TaskHandle, Child>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Executor for ProcessExecutor {
    async fn submit(&self, spec: WorkSpec) -> Result<TaskHandle, ExecutorError> {
        let payload = serde_json::to_vec_pretty(&spec)
            .map_err(|e| ExecutorError::Failed(format!("encode work spec: {e}")))?;
        let spec_path = spec.workspace.join(WORKSPEC_FILE);
        tokio::fs::write(&spec_path, &payload)
            .await
            .map_err(|e| ExecutorError::Unavailable(format!("{}: {e}", spec_path.display())))?;

        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(&spec.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutorError::Unavailable(format!(
                    "spawn {}: {e}",
                    self.command.program.display()
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&payload).await {
                    debug!(error = %err, "worker closed stdin early");
                }
            });
        }

        let handle = TaskHandle(format!("{}/{}", spec.job_id, Uuid::new_v4().simple()));
        info!(task = %handle, pid = child.id(), trajectories = spec.trajectories, "worker spawned");
        self.lock_tasks().insert(handle.clone(), child);
        Ok(handle)
    }

    async fn wait(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> Result<Vec<Trajectory>, ExecutorError> {
        let child = self
            .lock_tasks()
            .remove(handle)
            .ok_or(ExecutorError::Cancelled)?;
        // Dropping `child` (timeout or a dropped future) kills the worker.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Err(_) => return Err(ExecutorError::Timeout(timeout)),
            Ok(Err(e)) => return Err(ExecutorError::Failed(format!("worker i/o: {e}"))),
            Ok(Ok(output)) => output,
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .chars()
                .rev()
                .take(STDERR_TAIL)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            warn!(task = %handle, status = %output.status, "worker failed");
            return Err(ExecutorError::Failed(format!(
                "worker exited with {}: {}",
                output.status,
                tail.trim()
            )));
        }
        serde_json::from_slice(&output.stdout)
            .map_err(|e| ExecutorError::Failed(format!("malformed worker output: {e}")))
    }

    async fn cancel(&self, handle: &TaskHandle) {
        let child = self.lock_tasks().remove(handle);
        if let Some(mut child) = child {
            if let Err(err) = child.kill().await {
                warn!(task = %handle, error = %err, "failed to kill worker");
            } else {
                info!(task = %handle, "worker killed");
            }
        }
    }
}
