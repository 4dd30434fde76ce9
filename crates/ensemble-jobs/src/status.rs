// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Job lifecycle state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job.
///
/// ```text
/// NOT_INIT → INSTALLING → READY → RUNNING → COMPLETE
/// RUNNING ⇄ PAUSED
/// INSTALLING | READY | RUNNING → HALTED
/// READY | RUNNING | PAUSED → STOPPED
/// ```
///
/// `COMPLETE`, `STOPPED` and `HALTED` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Created, nothing done yet.
    NotInit,
    /// Workspace being prepared.
    Installing,
    /// Workspace ready; waiting for the executor to accept the task.
    Ready,
    /// Submitted to the executor.
    Running,
    /// Held by an operator; results are kept but not committed.
    Paused,
    /// Cancelled. Never retried.
    Stopped,
    /// Trajectories appended to the cache.
    Complete,
    /// Failed permanently.
    Halted,
}

impl JobStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [Self; 8] = [
        Self::NotInit,
        Self::Installing,
        Self::Ready,
        Self::Running,
        Self::Paused,
        Self::Stopped,
        Self::Complete,
        Self::Halted,
    ];

    /// Returns `true` for `COMPLETE`, `STOPPED` and `HALTED`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Stopped | Self::Halted)
    }

    /// Returns `true` while the job still owns its signature.
    pub const fn is_active(self) -> bool {
        !self.is_terminal()
    }

    /// Whether `self → next` is a legal edge. Self-transitions never are.
    pub const fn can_transition_to(self, next: Self) -> bool {
        use JobStatus::{Complete, Halted, Installing, NotInit, Paused, Ready, Running, Stopped};
        matches!(
            (self, next),
            (NotInit, Installing)
                | (Installing, Ready | Halted)
                | (Ready, Running | Halted | Stopped)
                | (Running, Paused | Complete | Halted | Stopped)
                | (Paused, Running | Stopped)
        )
    }

    /// Wire name, e.g. `NOT_INIT`.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotInit => "NOT_INIT",
            Self::Installing => "INSTALLING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Stopped => "STOPPED",
            Self::Complete => "COMPLETE",
            Self::Halted => "HALTED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized job status name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStatus(s.to_owned()))
    }
}
