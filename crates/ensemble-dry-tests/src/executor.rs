// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scripted [`Executor`] fake.
//!
//! Each submission consumes the next [`Step`] from the script (falling back
//! to a default step once the script runs dry). A shared gate lets tests keep
//! tasks "running" until they call [`ScriptedExecutor::release`].

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ensemble_cache::Trajectory;
use ensemble_jobs::{Executor, ExecutorError, TaskHandle, WorkSpec};
use serde_json::json;
use tokio::sync::watch;

/// What one submission does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Succeed with exactly the requested number of trajectories.
    Produce,
    /// Succeed with this many trajectories, whatever was requested.
    ProduceCount(u64),
    /// `submit` itself fails.
    RejectSubmit(ExecutorError),
    /// `submit` succeeds; `wait` fails.
    FailWait(ExecutorError),
}

#[derive(Default)]
struct Inner {
    script: VecDeque<Step>,
    fallback: Option<Step>,
    tasks: HashMap<TaskHandle, (WorkSpec, Step)>,
    submitted: Vec<WorkSpec>,
    cancelled: Vec<TaskHandle>,
    waits: usize,
    next_task: u64,
}

/// [`Executor`] whose outcomes are decided by the test.
///
/// Clones share the script, the counters and the gate.
#[derive(Clone)]
pub struct ScriptedExecutor {
    inner: Arc<Mutex<Inner>>,
    gate: Arc<watch::Sender<bool>>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    /// Executor that always produces the requested trajectories.
    pub fn new() -> Self {
        let (gate, _) = watch::channel(true);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            gate: Arc::new(gate),
        }
    }

    /// Executor whose every task fails with `err` once awaited.
    pub fn failing(err: ExecutorError) -> Self {
        let exec = Self::new();
        exec.lock().fallback = Some(Step::FailWait(err));
        exec
    }

    /// Executor that starts with its gate closed (see [`Self::hold`]).
    pub fn held() -> Self {
        let exec = Self::new();
        exec.hold();
        exec
    }

    /// Queue `step` for the next unscripted submission.
    pub fn then(self, step: Step) -> Self {
        self.lock().script.push_back(step);
        self
    }

    /// Replace the step used once the script is exhausted.
    pub fn set_fallback(&self, step: Step) {
        self.lock().fallback = Some(step);
    }

    /// Block every `wait` until [`Self::release`] (or its timeout).
    pub fn hold(&self) {
        self.gate.send_replace(false);
    }

    /// Let held and future `wait` calls finish.
    pub fn release(&self) {
        self.gate.send_replace(true);
    }

    /// Number of `submit` calls, rejected ones included.
    pub fn submit_count(&self) -> usize {
        self.lock().submitted.len()
    }

    /// Work specs seen by `submit`, in order.
    pub fn submitted(&self) -> Vec<WorkSpec> {
        self.lock().submitted.clone()
    }

    /// Number of `wait` calls.
    pub fn wait_count(&self) -> usize {
        self.lock().waits
    }

    /// Handles passed to `cancel`, in order.
    pub fn cancelled(&self) -> Vec<TaskHandle> {
        self.lock().cancelled.clone()
    }

    /// Submitted tasks not yet awaited to completion or cancelled.
    pub fn in_flight(&self) -> usize {
        self.lock().tasks.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn trajectories(spec: &WorkSpec, count: u64) -> Vec<Trajectory> {
    (0..count)
        .map(|index| {
            Trajectory(json!({
                "job": spec.job_id.to_string(),
                "index": index,
                "time": [0.0, 0.5, 1.0],
            }))
        })
        .collect()
}

impl Executor for ScriptedExecutor {
    async fn submit(&self, spec: WorkSpec) -> Result<TaskHandle, ExecutorError> {
        let mut inner = self.lock();
        let step = inner
            .script
            .pop_front()
            .or_else(|| inner.fallback.clone())
            .unwrap_or(Step::Produce);
        inner.submitted.push(spec.clone());
        if let Step::RejectSubmit(err) = step {
            return Err(err);
        }
        inner.next_task += 1;
        let handle = TaskHandle(format!("scripted-{}", inner.next_task));
        inner.tasks.insert(handle.clone(), (spec, step));
        Ok(handle)
    }

    async fn wait(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> Result<Vec<Trajectory>, ExecutorError> {
        self.lock().waits += 1;
        let mut gate = self.gate.subscribe();
        let opened = tokio::time::timeout(timeout, async move {
            gate.wait_for(|open| *open).await.is_ok()
        })
        .await;
        if opened.is_err() {
            return Err(ExecutorError::Timeout(timeout));
        }
        let (spec, step) = self
            .lock()
            .tasks
            .remove(handle)
            .ok_or(ExecutorError::Cancelled)?;
        match step {
            Step::Produce => Ok(trajectories(&spec, spec.trajectories)),
            Step::ProduceCount(count) => Ok(trajectories(&spec, count)),
            Step::FailWait(err) | Step::RejectSubmit(err) => Err(err),
        }
    }

    async fn cancel(&self, handle: &TaskHandle) {
        let mut inner = self.lock();
        inner.tasks.remove(handle);
        inner.cancelled.push(handle.clone());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ensemble_cache::{JobId, Signature};

    fn spec(n: u64) -> WorkSpec {
        WorkSpec {
            job_id: JobId::new(),
            signature: Signature([1; 32]),
            model: json!({}),
            kwargs: serde_json::Map::new(),
            trajectories: n,
            workspace: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn script_then_fallback() {
        let exec = ScriptedExecutor::new()
            .then(Step::RejectSubmit(ExecutorError::Unavailable("down".into())))
            .then(Step::ProduceCount(1));
        assert!(exec.submit(spec(3)).await.is_err());
        let h = exec.submit(spec(3)).await.unwrap();
        assert_eq!(exec.wait(&h, Duration::from_secs(1)).await.unwrap().len(), 1);
        let h = exec.submit(spec(3)).await.unwrap();
        assert_eq!(exec.wait(&h, Duration::from_secs(1)).await.unwrap().len(), 3);
        assert_eq!(exec.submit_count(), 3);
    }

    #[tokio::test]
    async fn held_gate_times_out_then_releases() {
        let exec = ScriptedExecutor::held();
        let h = exec.submit(spec(2)).await.unwrap();
        let err = exec.wait(&h, Duration::from_millis(20)).await.unwrap_err();
        assert_eq!(err, ExecutorError::Timeout(Duration::from_millis(20)));
        exec.release();
        assert_eq!(exec.wait(&h, Duration::from_secs(1)).await.unwrap().len(), 2);
        assert_eq!(exec.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_task_reports_cancelled() {
        let exec = ScriptedExecutor::new();
        let h = exec.submit(spec(1)).await.unwrap();
        exec.cancel(&h).await;
        assert_eq!(
            exec.wait(&h, Duration::from_secs(1)).await.unwrap_err(),
            ExecutorError::Cancelled
        );
        assert_eq!(exec.cancelled(), vec![h]);
    }
}
