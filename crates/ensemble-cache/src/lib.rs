// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Trajectory cache for Ensemble.
//!
//! `ensemble-cache` provides the [`CacheStore`] trait: a per-[`Signature`]
//! record of how many trajectories are stored plus the trajectories
//! themselves. Two tiers ship: [`MemoryTier`] (process-local) and [`DiskTier`]
//! (durable, crash-safe appends).
//!
//! # Coverage Invariants
//!
//! - `stored_count(sig)` never decreases while an entry is readable.
//! - `is_ready(sig, n)` holds iff `read(sig)` returns at least `n` trajectories.
//! - `append` is idempotent per [`JobId`]: re-delivering the batch of the job
//!   recorded as `last_applied_job_id` changes nothing.
//!
//! # Absence Semantics
//!
//! A missing entry is not an error for the metadata queries; it simply has no
//! coverage. Entries are never deleted here (retention is an external
//! concern), and an entry that fails integrity checks is reported as absent
//! rather than served partially.
#![forbid(unsafe_code)]

mod disk;
mod memory;

pub use disk::{DiskTier, RecoveryReport};
pub use memory::MemoryTier;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub use ensemble_fingerprint::Signature;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of the job that produced a batch of trajectories.
///
/// UUID v4, so identifiers stay unique across daemon restarts; the cache
/// relies on that for append idempotence.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// A fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// One simulated sample. Opaque to the cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Trajectory(pub serde_json::Value);

impl From<serde_json::Value> for Trajectory {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// Result of a successful [`CacheStore::append`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The batch was persisted.
    Applied {
        /// Coverage after the append.
        stored_count: u64,
    },
    /// The batch's job had already been applied; nothing changed.
    AlreadyApplied {
        /// Coverage (unchanged).
        stored_count: u64,
    },
}

impl AppendOutcome {
    /// Coverage after the call, whichever way it went.
    pub fn stored_count(self) -> u64 {
        match self {
            Self::Applied { stored_count } | Self::AlreadyApplied { stored_count } => stored_count,
        }
    }
}

/// Metadata snapshot for one entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryInfo {
    /// Trajectories stored.
    pub stored_count: u64,
    /// Job whose batch was applied last, if any.
    pub last_applied_job_id: Option<JobId>,
    /// Number of appended batches.
    pub batches: usize,
}

/// Errors raised by cache stores.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// No readable entry exists for the signature.
    #[error("no cached trajectories for {signature}")]
    NotFound {
        /// The signature that was looked up.
        signature: Signature,
    },
    /// Filesystem failure.
    #[error("i/o error at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// A batch could not be encoded for storage.
    #[error("failed to encode trajectories: {0}")]
    Encode(String),
}

/// Durable, per-signature trajectory store.
///
/// Implementations serialize mutations per signature; callers never need
/// external locking. All methods take `&self`.
pub trait CacheStore: Send + Sync {
    /// Metadata for `signature`, or `None` when no readable entry exists.
    fn entry_info(&self, signature: &Signature) -> Option<EntryInfo>;

    /// All trajectories in arrival order.
    ///
    /// # Errors
    ///
    /// [`CacheError::NotFound`] when no readable entry exists, including entries
    /// that fail integrity checks.
    fn read(&self, signature: &Signature) -> Result<Vec<Trajectory>, CacheError>;

    /// Atomically add `trajectories` produced by `job`.
    ///
    /// Creates the entry on first use. Replaying the job recorded as the
    /// entry's last applied job returns [`AppendOutcome::AlreadyApplied`].
    fn append(
        &self,
        signature: &Signature,
        job: JobId,
        trajectories: &[Trajectory],
    ) -> Result<AppendOutcome, CacheError>;

    /// Coverage for `signature`; zero when absent.
    fn stored_count(&self, signature: &Signature) -> u64 {
        self.entry_info(signature).map_or(0, |info| info.stored_count)
    }

    /// `true` iff at least `n` trajectories are stored. `n == 0` is always ready.
    fn is_ready(&self, signature: &Signature, n: u64) -> bool {
        n == 0 || self.stored_count(signature) >= n
    }

    /// `max(0, n - stored_count - in_flight_target)`.
    ///
    /// `in_flight_target` is the delta an active job has already claimed, so
    /// it is never requested twice.
    fn needed_delta(&self, signature: &Signature, n: u64, in_flight_target: u64) -> u64 {
        n.saturating_sub(self.stored_count(signature))
            .saturating_sub(in_flight_target)
    }
}

impl<T: CacheStore + ?Sized> CacheStore for std::sync::Arc<T> {
    fn entry_info(&self, signature: &Signature) -> Option<EntryInfo> {
        (**self).entry_info(signature)
    }

    fn read(&self, signature: &Signature) -> Result<Vec<Trajectory>, CacheError> {
        (**self).read(signature)
    }

    fn append(
        &self,
        signature: &Signature,
        job: JobId,
        trajectories: &[Trajectory],
    ) -> Result<AppendOutcome, CacheError> {
        (**self).append(signature, job, trajectories)
    }
}
