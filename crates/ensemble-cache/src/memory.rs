// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! In-memory trajectory cache.
//!
//! [`MemoryTier`] keeps everything in a single map behind one mutex. It backs
//! unit tests and daemons started without a cache directory; nothing
//! survives the process.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::{AppendOutcome, CacheError, CacheStore, EntryInfo, JobId, Signature, Trajectory};

#[derive(Default)]
struct MemoryEntry {
    trajectories: Vec<Trajectory>,
    last_applied: Option<JobId>,
    batches: usize,
}

/// In-memory [`CacheStore`].
///
/// One store-wide mutex serializes every append, which trivially satisfies
/// the per-signature exclusion requirement.
#[derive(Default)]
pub struct MemoryTier {
    entries: Mutex<HashMap<Signature, MemoryEntry>>,
}

impl MemoryTier {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of signatures with an entry.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if no entry exists.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Signature, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CacheStore for MemoryTier {
    fn entry_info(&self, signature: &Signature) -> Option<EntryInfo> {
        self.lock().get(signature).map(|entry| EntryInfo {
            stored_count: entry.trajectories.len() as u64,
            last_applied_job_id: entry.last_applied,
            batches: entry.batches,
        })
    }

    fn read(&self, signature: &Signature) -> Result<Vec<Trajectory>, CacheError> {
        self.lock()
            .get(signature)
            .map(|entry| entry.trajectories.clone())
            .ok_or(CacheError::NotFound {
                signature: *signature,
            })
    }

    fn append(
        &self,
        signature: &Signature,
        job: JobId,
        trajectories: &[Trajectory],
    ) -> Result<AppendOutcome, CacheError> {
        let mut entries = self.lock();
        let entry = entries.entry(*signature).or_default();
        if entry.last_applied == Some(job) {
            return Ok(AppendOutcome::AlreadyApplied {
                stored_count: entry.trajectories.len() as u64,
            });
        }
        entry.trajectories.extend_from_slice(trajectories);
        entry.last_applied = Some(job);
        entry.batches += 1;
        let stored_count = entry.trajectories.len() as u64;
        debug!(%signature, %job, added = trajectories.len(), stored_count, "append applied");
        Ok(AppendOutcome::Applied { stored_count })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sig(byte: u8) -> Signature {
        Signature([byte; 32])
    }

    fn batch(start: u64, len: u64) -> Vec<Trajectory> {
        (start..start + len)
            .map(|i| Trajectory(json!({ "index": i })))
            .collect()
    }

    // ── 1. absent entry has no coverage ─────────────────────────────────

    #[test]
    fn absent_entry_is_empty_not_error() {
        let store = MemoryTier::new();
        assert!(store.entry_info(&sig(1)).is_none());
        assert_eq!(store.stored_count(&sig(1)), 0);
        assert!(store.is_ready(&sig(1), 0));
        assert!(!store.is_ready(&sig(1), 1));
        assert!(matches!(
            store.read(&sig(1)),
            Err(CacheError::NotFound { .. })
        ));
    }

    // ── 2. append grows coverage in arrival order ───────────────────────

    #[test]
    fn append_grows_coverage_in_order() {
        let store = MemoryTier::new();
        store.append(&sig(2), JobId::new(), &batch(0, 10)).unwrap();
        store.append(&sig(2), JobId::new(), &batch(10, 5)).unwrap();
        let all = store.read(&sig(2)).unwrap();
        assert_eq!(all.len(), 15);
        assert_eq!(all, batch(0, 15));
        assert!(store.is_ready(&sig(2), 15));
        assert!(!store.is_ready(&sig(2), 16));
        assert_eq!(store.entry_info(&sig(2)).unwrap().batches, 2);
    }

    // ── 3. replaying the last job is a no-op ────────────────────────────

    #[test]
    fn replayed_job_does_not_double_count() {
        let store = MemoryTier::new();
        let job = JobId::new();
        let first = store.append(&sig(3), job, &batch(0, 4)).unwrap();
        let again = store.append(&sig(3), job, &batch(0, 4)).unwrap();
        assert_eq!(first, AppendOutcome::Applied { stored_count: 4 });
        assert_eq!(again, AppendOutcome::AlreadyApplied { stored_count: 4 });
        assert_eq!(store.stored_count(&sig(3)), 4);
    }

    // ── 4. needed_delta subtracts coverage and in-flight work ───────────

    #[test]
    fn needed_delta_accounts_for_in_flight() {
        let store = MemoryTier::new();
        store.append(&sig(4), JobId::new(), &batch(0, 10)).unwrap();
        assert_eq!(store.needed_delta(&sig(4), 15, 0), 5);
        assert_eq!(store.needed_delta(&sig(4), 15, 5), 0);
        assert_eq!(store.needed_delta(&sig(4), 15, 9), 0);
        assert_eq!(store.needed_delta(&sig(4), 8, 0), 0);
        assert_eq!(store.needed_delta(&sig(5), 3, 1), 2);
    }

    // ── 5. signatures are isolated ──────────────────────────────────────

    #[test]
    fn signatures_do_not_share_entries() {
        let store = MemoryTier::new();
        store.append(&sig(6), JobId::new(), &batch(0, 2)).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.stored_count(&sig(7)), 0);
    }

    // ── 6. empty batch still records the job ────────────────────────────

    #[test]
    fn empty_batch_creates_entry_and_records_job() {
        let store = MemoryTier::new();
        let job = JobId::new();
        store.append(&sig(8), job, &[]).unwrap();
        let info = store.entry_info(&sig(8)).unwrap();
        assert_eq!(info.stored_count, 0);
        assert_eq!(info.last_applied_job_id, Some(job));
        assert!(store.read(&sig(8)).unwrap().is_empty());
    }
}
