// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Job coordination for Ensemble.
//!
//! - [`status`]: the [`JobStatus`] state machine.
//! - [`coordinator`]: single-flight reservation, job lifecycle, commit to the
//!   cache.
//! - [`executor`]: the submit/await/cancel port, with [`process`] as the
//!   local worker-process adapter.
//! - [`workspace`]: per-job scratch directories.
//! - [`retry`]: job-level retry budget and backoff.
#![forbid(unsafe_code)]

pub mod coordinator;
pub mod executor;
pub mod process;
pub mod retry;
pub mod status;
pub mod workspace;

pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorError, JobFailure, JobSnapshot, Reservation,
};
pub use executor::{Executor, ExecutorError, TaskHandle, WorkSpec};
pub use process::{ProcessExecutor, WorkerCommand};
pub use retry::RetryPolicy;
pub use status::JobStatus;
pub use workspace::{Workspace, WorkspaceError, WorkspaceRoot};
