// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Query facade for Ensemble.
//!
//! [`QueryHandler`] composes cache metadata with coordinator state to answer
//! client questions. Status is derived in a fixed order:
//!
//! 1. `ready` if the cache holds at least `n` trajectories;
//! 2. `running` if a job is active for the signature;
//! 3. `error` if the last job for the signature halted;
//! 4. `pending` otherwise.
//!
//! Nothing here blocks on simulation work.
#![forbid(unsafe_code)]

pub mod dto;

use ensemble_cache::{CacheError, CacheStore, JobId, Signature, Trajectory};
use ensemble_fingerprint::{InvalidModelError, SimulationRequest};
use ensemble_jobs::{Coordinator, CoordinatorError, Executor, JobStatus, Reservation};
use tracing::{debug, info, instrument};

pub use dto::{
    CachedReply, JobView, QueryStatus, ResultsPayload, SignalRequest, StatusReport, SubmitAck,
};

/// Errors surfaced to clients.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// The run request could not be fingerprinted.
    #[error(transparent)]
    InvalidModel(#[from] InvalidModelError),
    /// Fewer than `n` trajectories are available (or the entry is unreadable).
    #[error("fewer than {n} trajectories cached for {signature}")]
    NotFound {
        /// Signature queried.
        signature: Signature,
        /// Trajectories requested.
        n: u64,
    },
    /// The coordinator refused the operation.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    /// The cache failed for a reason other than absence.
    #[error(transparent)]
    Cache(CacheError),
}

/// Client-facing queries over a [`Coordinator`] and its cache.
pub struct QueryHandler<C, E> {
    coordinator: Coordinator<C, E>,
}

impl<C, E> Clone for QueryHandler<C, E> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<C, E> QueryHandler<C, E>
where
    C: CacheStore + 'static,
    E: Executor,
{
    /// Handler answering from `coordinator`.
    pub fn new(coordinator: Coordinator<C, E>) -> Self {
        Self { coordinator }
    }

    /// The coordinator behind this handler.
    pub fn coordinator(&self) -> &Coordinator<C, E> {
        &self.coordinator
    }

    /// Whether at least `n` trajectories are cached.
    pub fn is_cached(&self, signature: &Signature, n: u64) -> bool {
        self.coordinator.cache().is_ready(signature, n)
    }

    /// Coarse status of `(signature, n)`.
    pub fn status(&self, signature: &Signature, n: u64) -> StatusReport {
        if self.is_cached(signature, n) {
            return StatusReport {
                status: QueryStatus::Ready,
                message: None,
                job_id: None,
            };
        }
        if let Some(job) = self.coordinator.active_job(signature) {
            return StatusReport {
                status: QueryStatus::Running,
                message: None,
                job_id: Some(job.job_id),
            };
        }
        if let Some(failure) = self.coordinator.failure(signature) {
            return StatusReport {
                status: QueryStatus::Error,
                message: Some(failure.message),
                job_id: Some(failure.job_id),
            };
        }
        StatusReport {
            status: QueryStatus::Pending,
            message: None,
            job_id: None,
        }
    }

    /// The first `n` cached trajectories, in arrival order.
    pub fn results(&self, signature: &Signature, n: u64) -> Result<Vec<Trajectory>, QueryError> {
        let not_found = || QueryError::NotFound {
            signature: *signature,
            n,
        };
        if !self.is_cached(signature, n) {
            return Err(not_found());
        }
        let mut trajectories = match self.coordinator.cache().read(signature) {
            Ok(trajectories) => trajectories,
            Err(CacheError::NotFound { .. }) => return Err(not_found()),
            Err(err) => return Err(QueryError::Cache(err)),
        };
        // Coverage and payload are checked separately; never hand out a short read.
        if (trajectories.len() as u64) < n {
            return Err(not_found());
        }
        trajectories.truncate(usize::try_from(n).unwrap_or(usize::MAX));
        Ok(trajectories)
    }

    /// Fingerprint `request` and make sure its trajectories exist or are
    /// being produced.
    #[instrument(skip_all)]
    pub fn submit(&self, request: &SimulationRequest) -> Result<SubmitAck, QueryError> {
        let signature = request.signature()?;
        let n = request.trajectories()?;
        let reservation = self.coordinator.reserve_delta(signature, n, request)?;
        debug!(%signature, n, ?reservation, "run reserved");
        let (status, job_id, message) = match reservation {
            Reservation::Satisfied { .. } => (QueryStatus::Ready, None, None),
            Reservation::Joined(job) | Reservation::Created(job) => match job.status {
                JobStatus::Halted => (QueryStatus::Error, Some(job.job_id), job.message),
                JobStatus::Complete if self.is_cached(&signature, n) => {
                    (QueryStatus::Ready, Some(job.job_id), None)
                }
                JobStatus::Stopped => (QueryStatus::Pending, Some(job.job_id), job.message),
                _ => (QueryStatus::Running, Some(job.job_id), None),
            },
        };
        info!(%signature, n, ?status, "run acknowledged");
        Ok(SubmitAck {
            signature,
            n,
            status,
            job_id,
            message,
        })
    }

    /// Detail for one job, if it is active or recently finished.
    pub fn job(&self, job: JobId) -> Option<JobView> {
        self.coordinator.job(job).map(JobView::from)
    }

    /// Apply an operator status change.
    pub fn signal(&self, job: JobId, status: JobStatus) -> Result<JobStatus, QueryError> {
        Ok(self.coordinator.signal(job, status)?)
    }
}
