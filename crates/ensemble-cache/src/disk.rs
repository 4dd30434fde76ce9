// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Durable trajectory cache.
//!
//! Layout under the root, one namespace per signature:
//!
//! ```text
//! <root>/<signature-hex>/meta.json          checksummed metadata (commit point)
//! <root>/<signature-hex>/segments/<seq>.cbor one CBOR batch per applied job
//! <root>/<signature-hex>/.tmp/              staging for atomic writes
//! ```
//!
//! An append stages the segment, fsyncs, renames it into `segments/`, then
//! stages and renames `meta.json`. Until the metadata rename lands the new
//! segment is unreferenced and invisible; a crash at any point leaves either
//! the old entry or the new one, never a mix. [`DiskTier::recover`] removes
//! whatever an interrupted append left behind.
//!
//! Loading a namespace checks the metadata checksum and the recorded length of
//! every segment; segment digests are checked when the segments are read. A
//! segment that fails its digest quarantines the metadata, so the namespace
//! reads as absent from then on. I/O failures never count as corruption: they
//! surface as [`CacheError::Io`] and the next access loads from disk again.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::{AppendOutcome, CacheError, CacheStore, EntryInfo, JobId, Signature, Trajectory};

const META_FILE: &str = "meta.json";
const QUARANTINE_FILE: &str = "meta.json.corrupt";
const SEGMENT_DIR: &str = "segments";
const STAGING_DIR: &str = ".tmp";
const SEGMENT_EXT: &str = "cbor";
const META_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SegmentRecord {
    seq: u64,
    count: u64,
    len: u64,
    job_id: JobId,
    digest: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct MetaBody {
    version: u32,
    stored_count: u64,
    last_applied_job_id: Option<JobId>,
    segments: Vec<SegmentRecord>,
}

#[derive(Serialize, Deserialize)]
struct MetaFile {
    #[serde(flatten)]
    body: MetaBody,
    checksum: String,
}

impl MetaBody {
    fn empty() -> Self {
        Self {
            version: META_VERSION,
            stored_count: 0,
            last_applied_job_id: None,
            segments: Vec::new(),
        }
    }

    fn checksum(&self) -> Result<String, CacheError> {
        let bytes = serde_json::to_vec(self).map_err(|e| CacheError::Encode(e.to_string()))?;
        Ok(blake3::hash(&bytes).to_hex().to_string())
    }

    fn info(&self) -> EntryInfo {
        EntryInfo {
            stored_count: self.stored_count,
            last_applied_job_id: self.last_applied_job_id,
            batches: self.segments.len(),
        }
    }

    fn next_seq(&self) -> u64 {
        self.segments.last().map_or(0, |s| s.seq + 1)
    }
}

/// Result of loading a namespace from disk.
enum Loaded {
    Absent,
    /// Metadata failed its integrity checks. Reads report absence; the next
    /// append starts the namespace over.
    Corrupt,
    Present(MetaBody),
}

/// A namespace as seen under its lock.
enum View<'a> {
    Absent,
    Corrupt,
    Present(&'a MetaBody),
}

enum SegmentFault {
    Io(CacheError),
    Integrity(String),
}

/// Verified metadata, or `None` when nothing is held in memory.
type Slot = Arc<Mutex<Option<MetaBody>>>;

/// Outcome of a [`DiskTier::recover`] sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Namespaces visited.
    pub namespaces: usize,
    /// Staged files from interrupted writes that were deleted.
    pub staged_files_removed: usize,
    /// Segment files no committed metadata referenced, deleted.
    pub orphan_segments_removed: usize,
    /// Namespaces whose metadata failed verification (left untouched).
    pub corrupt_namespaces: usize,
    /// Namespaces skipped because a file could not be read.
    pub unavailable_namespaces: usize,
}

/// Filesystem-backed [`CacheStore`].
///
/// Each signature has its own lock; appends for different signatures proceed
/// in parallel. Verified metadata is cached in memory after first use, so
/// `entry_info` is a map lookup on the hot path. Lookups that find nothing
/// leave nothing behind.
pub struct DiskTier {
    root: PathBuf,
    slots: Mutex<HashMap<Signature, Slot>>,
}

impl DiskTier {
    /// Open (creating if needed) a cache rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_err(&root, e))?;
        Ok(Self {
            root,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Signatures that have a namespace directory, sorted.
    pub fn signatures(&self) -> Result<Vec<Signature>, CacheError> {
        let mut out: BTreeSet<Signature> = BTreeSet::new();
        for entry in fs::read_dir(&self.root).map_err(|e| io_err(&self.root, e))? {
            let entry = entry.map_err(|e| io_err(&self.root, e))?;
            if let Some(sig) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
                out.insert(sig);
            }
        }
        Ok(out.into_iter().collect())
    }

    /// Namespaces whose verified metadata is held in memory.
    pub fn resident_namespaces(&self) -> usize {
        self.lock_slots().len()
    }

    /// Reconcile the cache after an unclean shutdown.
    ///
    /// Deletes staging directories and segments that no committed metadata
    /// references. Namespaces with corrupt or unreadable metadata are counted
    /// but left alone. Drops the in-memory metadata cache.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub fn recover(&self) -> Result<RecoveryReport, CacheError> {
        let mut report = RecoveryReport::default();
        for sig in self.signatures()? {
            report.namespaces += 1;
            let dir = self.namespace(&sig);

            let staging = dir.join(STAGING_DIR);
            report.staged_files_removed += remove_dir_counting(&staging)?;

            let referenced: BTreeSet<u64> = match load_meta(&dir, &sig) {
                Ok(Loaded::Present(body)) => body.segments.iter().map(|s| s.seq).collect(),
                Ok(Loaded::Corrupt) => {
                    report.corrupt_namespaces += 1;
                    continue;
                }
                Ok(Loaded::Absent) => BTreeSet::new(),
                Err(err) => {
                    warn!(%sig, error = %err, "namespace unreadable; left as is");
                    report.unavailable_namespaces += 1;
                    continue;
                }
            };

            let segments = dir.join(SEGMENT_DIR);
            let listing = match fs::read_dir(&segments) {
                Ok(listing) => listing,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err(&segments, e)),
            };
            for entry in listing {
                let entry = entry.map_err(|e| io_err(&segments, e))?;
                let path = entry.path();
                let keep = segment_seq(&path).is_some_and(|seq| referenced.contains(&seq));
                if !keep {
                    fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
                    report.orphan_segments_removed += 1;
                }
            }
        }
        self.lock_slots().clear();
        info!(
            namespaces = report.namespaces,
            staged = report.staged_files_removed,
            orphans = report.orphan_segments_removed,
            corrupt = report.corrupt_namespaces,
            unavailable = report.unavailable_namespaces,
            "cache recovery complete"
        );
        Ok(report)
    }

    fn namespace(&self, signature: &Signature) -> PathBuf {
        self.root.join(signature.to_hex())
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<Signature, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` with the signature's lock held.
    ///
    /// A slot left empty is dropped from the map once no other caller holds
    /// it, so only namespaces with verified metadata stay resident.
    fn with_slot<R>(
        &self,
        signature: &Signature,
        f: impl FnOnce(&Path, &mut Option<MetaBody>) -> R,
    ) -> R {
        let slot = Arc::clone(self.lock_slots().entry(*signature).or_default());
        let dir = self.namespace(signature);
        let (out, resident) = {
            let mut state = slot.lock().unwrap_or_else(|e| e.into_inner());
            let out = f(&dir, &mut state);
            (out, state.is_some())
        };
        if !resident {
            let mut slots = self.lock_slots();
            // Two strong references: the map's and ours.
            let idle = slots
                .get(signature)
                .is_some_and(|held| Arc::ptr_eq(held, &slot) && Arc::strong_count(&slot) == 2);
            if idle {
                slots.remove(signature);
            }
        }
        out
    }
}

/// The namespace's metadata, from memory or a fresh load.
fn view<'a>(
    dir: &Path,
    signature: &Signature,
    state: &'a mut Option<MetaBody>,
) -> Result<View<'a>, CacheError> {
    if state.is_none() {
        match load_meta(dir, signature)? {
            Loaded::Absent => return Ok(View::Absent),
            Loaded::Corrupt => return Ok(View::Corrupt),
            Loaded::Present(body) => *state = Some(body),
        }
    }
    Ok(state.as_ref().map_or(View::Absent, View::Present))
}

impl CacheStore for DiskTier {
    fn entry_info(&self, signature: &Signature) -> Option<EntryInfo> {
        self.with_slot(signature, |dir, state| match view(dir, signature, state) {
            Ok(View::Present(body)) => Some(body.info()),
            Ok(View::Absent | View::Corrupt) => None,
            Err(err) => {
                warn!(%signature, error = %err, "cache metadata unavailable");
                None
            }
        })
    }

    fn read(&self, signature: &Signature) -> Result<Vec<Trajectory>, CacheError> {
        self.with_slot(signature, |dir, state| {
            let View::Present(body) = view(dir, signature, state)? else {
                return Err(CacheError::NotFound {
                    signature: *signature,
                });
            };
            match read_segments(dir, body) {
                Ok(trajectories) => Ok(trajectories),
                Err(SegmentFault::Io(err)) => Err(err),
                Err(SegmentFault::Integrity(reason)) => {
                    warn!(%signature, %reason, "segment failed verification; quarantining entry");
                    *state = None;
                    quarantine(dir)?;
                    Err(CacheError::NotFound {
                        signature: *signature,
                    })
                }
            }
        })
    }

    fn append(
        &self,
        signature: &Signature,
        job: JobId,
        trajectories: &[Trajectory],
    ) -> Result<AppendOutcome, CacheError> {
        self.with_slot(signature, |dir, state| {
            let mut body = match view(dir, signature, state)? {
                View::Present(body) if body.last_applied_job_id == Some(job) => {
                    return Ok(AppendOutcome::AlreadyApplied {
                        stored_count: body.stored_count,
                    });
                }
                View::Present(body) => body.clone(),
                // Only reachable from a fresh load that failed its checks.
                View::Corrupt => {
                    warn!(%signature, "restarting corrupt cache namespace");
                    reset_namespace(dir)?;
                    MetaBody::empty()
                }
                View::Absent => MetaBody::empty(),
            };

            let staging = dir.join(STAGING_DIR);
            fs::create_dir_all(&staging).map_err(|e| io_err(&staging, e))?;

            if !trajectories.is_empty() {
                let mut bytes = Vec::new();
                ciborium::ser::into_writer(trajectories, &mut bytes)
                    .map_err(|e| CacheError::Encode(e.to_string()))?;
                let seq = body.next_seq();
                let segments = dir.join(SEGMENT_DIR);
                fs::create_dir_all(&segments).map_err(|e| io_err(&segments, e))?;
                write_atomic(&staging, &segments.join(segment_name(seq)), &bytes)?;
                body.segments.push(SegmentRecord {
                    seq,
                    count: trajectories.len() as u64,
                    len: bytes.len() as u64,
                    job_id: job,
                    digest: blake3::hash(&bytes).to_hex().to_string(),
                });
                body.stored_count += trajectories.len() as u64;
            }
            body.last_applied_job_id = Some(job);

            let meta = MetaFile {
                checksum: body.checksum()?,
                body,
            };
            let bytes =
                serde_json::to_vec_pretty(&meta).map_err(|e| CacheError::Encode(e.to_string()))?;
            write_atomic(&staging, &dir.join(META_FILE), &bytes)?;

            let stored_count = meta.body.stored_count;
            *state = Some(meta.body);
            debug!(%signature, %job, added = trajectories.len(), stored_count, "append committed");
            Ok(AppendOutcome::Applied { stored_count })
        })
    }
}

/// Load and check a namespace's metadata.
///
/// `Err` means the namespace could not be read right now; nothing about its
/// integrity is known and nothing is cached.
fn load_meta(dir: &Path, signature: &Signature) -> Result<Loaded, CacheError> {
    let path = dir.join(META_FILE);
    let bytes = match fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Loaded::Absent),
        Err(e) => return Err(io_err(&path, e)),
    };
    let body = match verify_meta(&bytes) {
        Ok(body) => body,
        Err(reason) => {
            warn!(%signature, %reason, "cache metadata failed verification; treating entry as absent");
            return Ok(Loaded::Corrupt);
        }
    };
    // Coverage must never be reported for bytes that cannot be served.
    for record in &body.segments {
        let path = dir.join(SEGMENT_DIR).join(segment_name(record.seq));
        let len = fs::metadata(&path).map_err(|e| io_err(&path, e))?.len();
        if len != record.len {
            warn!(
                %signature,
                seq = record.seq,
                len,
                recorded = record.len,
                "segment length disagrees with metadata; treating entry as absent"
            );
            return Ok(Loaded::Corrupt);
        }
    }
    Ok(Loaded::Present(body))
}

fn verify_meta(bytes: &[u8]) -> Result<MetaBody, String> {
    let meta: MetaFile = serde_json::from_slice(bytes).map_err(|e| e.to_string())?;
    if meta.body.version != META_VERSION {
        return Err(format!("unsupported metadata version {}", meta.body.version));
    }
    let computed = meta.body.checksum().map_err(|e| e.to_string())?;
    if computed != meta.checksum {
        return Err(format!(
            "checksum mismatch: recorded {}, computed {computed}",
            meta.checksum
        ));
    }
    let total: u64 = meta.body.segments.iter().map(|s| s.count).sum();
    if total != meta.body.stored_count {
        return Err(format!(
            "stored_count {} disagrees with segment total {total}",
            meta.body.stored_count
        ));
    }
    Ok(meta.body)
}

fn read_segments(dir: &Path, body: &MetaBody) -> Result<Vec<Trajectory>, SegmentFault> {
    let mut out = Vec::with_capacity(usize::try_from(body.stored_count).unwrap_or(0));
    for record in &body.segments {
        let path = dir.join(SEGMENT_DIR).join(segment_name(record.seq));
        let bytes = fs::read(&path).map_err(|e| SegmentFault::Io(io_err(&path, e)))?;
        check_digest(record, &bytes).map_err(SegmentFault::Integrity)?;
        let batch: Vec<Trajectory> = ciborium::de::from_reader(bytes.as_slice())
            .map_err(|e| SegmentFault::Integrity(e.to_string()))?;
        if batch.len() as u64 != record.count {
            return Err(SegmentFault::Integrity(format!(
                "segment {} holds {} trajectories, metadata says {}",
                record.seq,
                batch.len(),
                record.count
            )));
        }
        out.extend(batch);
    }
    Ok(out)
}

fn check_digest(record: &SegmentRecord, bytes: &[u8]) -> Result<(), String> {
    let digest = blake3::hash(bytes).to_hex();
    if digest.as_str() == record.digest {
        Ok(())
    } else {
        Err(format!("segment {} digest mismatch", record.seq))
    }
}

fn segment_name(seq: u64) -> String {
    format!("{seq:08}.{SEGMENT_EXT}")
}

fn segment_seq(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(&format!(".{SEGMENT_EXT}"))?.parse().ok()
}

/// Move the metadata aside so the namespace reads as absent.
fn quarantine(dir: &Path) -> Result<(), CacheError> {
    let from = dir.join(META_FILE);
    fs::rename(&from, dir.join(QUARANTINE_FILE)).map_err(|e| io_err(&from, e))?;
    sync_dir(dir)
}

fn reset_namespace(dir: &Path) -> Result<(), CacheError> {
    for name in [SEGMENT_DIR, STAGING_DIR] {
        let path = dir.join(name);
        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_err(&path, e)),
        }
    }
    Ok(())
}

/// Stage `bytes`, flush them to disk, then rename over `dest`.
fn write_atomic(staging: &Path, dest: &Path, bytes: &[u8]) -> Result<(), CacheError> {
    let tmp = staging.join(format!("{}.tmp", Uuid::new_v4().simple()));
    let mut file = File::create(&tmp).map_err(|e| io_err(&tmp, e))?;
    file.write_all(bytes).map_err(|e| io_err(&tmp, e))?;
    file.sync_all().map_err(|e| io_err(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, dest).map_err(|e| io_err(dest, e))?;
    if let Some(parent) = dest.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), CacheError> {
    File::open(dir)
        .and_then(|d| d.sync_all())
        .map_err(|e| io_err(dir, e))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), CacheError> {
    Ok(())
}

fn remove_dir_counting(dir: &Path) -> Result<usize, CacheError> {
    let listing = match fs::read_dir(dir) {
        Ok(listing) => listing,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_err(dir, e)),
    };
    let count = listing.filter_map(Result::ok).count();
    fs::remove_dir_all(dir).map_err(|e| io_err(dir, e))?;
    Ok(count)
}

fn io_err(path: &Path, source: std::io::Error) -> CacheError {
    CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}
