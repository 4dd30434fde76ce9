// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire shapes returned by the query surface.

use ensemble_cache::{JobId, Signature, Trajectory};
use ensemble_jobs::JobStatus;
use serde::{Deserialize, Serialize};

/// Client-facing status of `(signature, n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryStatus {
    /// Nothing cached and no job active.
    Pending,
    /// A job is producing trajectories for the signature.
    Running,
    /// At least `n` trajectories are cached.
    Ready,
    /// The last job for the signature halted.
    Error,
}

/// Response to a status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    /// Coarse status.
    pub status: QueryStatus,
    /// Failure reason when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Active (or failed) job, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// Acknowledgement of a run request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitAck {
    /// Signature the request resolved to; use it for later queries.
    pub signature: Signature,
    /// Requested trajectory count.
    pub n: u64,
    /// Status right after the reservation.
    pub status: QueryStatus,
    /// Job created or joined, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    /// Failure reason when `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Trajectories for `(signature, n)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsPayload {
    /// The first `n` trajectories in arrival order.
    pub trajectories: Vec<Trajectory>,
}

/// Answer to an `is_cached` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedReply {
    /// Whether `n` trajectories are available.
    pub cached: bool,
}

/// Job detail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    /// Job identifier.
    pub job_id: JobId,
    /// Signature the job produces for.
    pub signature: Signature,
    /// Trajectories the job was created to produce.
    pub delta: u64,
    /// Lifecycle status.
    pub status: JobStatus,
    /// Failure or cancellation reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<ensemble_jobs::JobSnapshot> for JobView {
    fn from(job: ensemble_jobs::JobSnapshot) -> Self {
        Self {
            job_id: job.job_id,
            signature: job.signature,
            delta: job.delta,
            status: job.status,
            message: job.message,
        }
    }
}

/// Request body for a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalRequest {
    /// Target status.
    pub status: JobStatus,
}
