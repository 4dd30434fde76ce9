// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Executor adapter port.
//!
//! The coordinator never runs simulations itself. It hands a [`WorkSpec`] to
//! an [`Executor`], keeps the returned [`TaskHandle`], and later awaits or
//! cancels it. Scheduling inside the executor is opaque; the coordinator only
//! owns job-level retry and cancellation.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use ensemble_cache::{JobId, Signature, Trajectory};
use serde::{Deserialize, Serialize};

/// Everything an executor needs to produce one batch of trajectories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkSpec {
    /// Job the batch belongs to.
    pub job_id: JobId,
    /// Signature the trajectories will be cached under.
    pub signature: Signature,
    /// Model definition, passed through untouched.
    pub model: serde_json::Value,
    /// Solver arguments; the trajectory count is set to `trajectories`.
    pub kwargs: serde_json::Map<String, serde_json::Value>,
    /// Number of trajectories to produce.
    pub trajectories: u64,
    /// The job's workspace directory.
    pub workspace: PathBuf,
}

/// Opaque reference to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskHandle(pub String);

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Executor failures as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutorError {
    /// Transient: the executor could not take or reach the task.
    #[error("executor unavailable: {0}")]
    Unavailable(String),
    /// The task did not finish within the allowed time.
    #[error("task timed out after {0:?}")]
    Timeout(Duration),
    /// The task ran and failed.
    #[error("task failed: {0}")]
    Failed(String),
    /// The task was cancelled.
    #[error("task cancelled")]
    Cancelled,
}

/// Submit/await/cancel contract over a distributed task executor.
///
/// Implementations must be cheap to share: the coordinator holds one instance
/// for the lifetime of the process and calls it from many tasks at once.
pub trait Executor: Send + Sync + 'static {
    /// Hand `spec` to the executor. Returns once the task is accepted.
    fn submit(
        &self,
        spec: WorkSpec,
    ) -> impl Future<Output = Result<TaskHandle, ExecutorError>> + Send;

    /// Await the task's trajectories, giving up after `timeout`.
    ///
    /// A `wait` future dropped before completion must not leak the task;
    /// the coordinator follows up with [`Executor::cancel`] regardless.
    fn wait(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Trajectory>, ExecutorError>> + Send;

    /// Best-effort cancellation. Cancelling an unknown or finished task is a
    /// no-op.
    fn cancel(&self, handle: &TaskHandle) -> impl Future<Output = ()> + Send;
}

impl<E: Executor> Executor for std::sync::Arc<E> {
    fn submit(
        &self,
        spec: WorkSpec,
    ) -> impl Future<Output = Result<TaskHandle, ExecutorError>> + Send {
        (**self).submit(spec)
    }

    fn wait(
        &self,
        handle: &TaskHandle,
        timeout: Duration,
    ) -> impl Future<Output = Result<Vec<Trajectory>, ExecutorError>> + Send {
        (**self).wait(handle, timeout)
    }

    fn cancel(&self, handle: &TaskHandle) -> impl Future<Output = ()> + Send {
        (**self).cancel(handle)
    }
}
