// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Command implementations. Output goes to the writer the caller passes in.

use std::io::Write;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ensemble_cache::{CacheStore, DiskTier, Signature};
use ensemble_fingerprint::SimulationRequest;
use ensemble_jobs::WorkspaceRoot;

/// Print the signature and trajectory count of a run request file.
pub fn signature(request: &Path, out: &mut impl Write) -> Result<()> {
    let raw = std::fs::read(request).with_context(|| format!("read {}", request.display()))?;
    let request: SimulationRequest =
        serde_json::from_slice(&raw).context("parse run request (expected {model, kwargs})")?;
    let signature = request.signature()?;
    let n = request.trajectories()?;
    writeln!(out, "{signature} {n}")?;
    Ok(())
}

/// List every namespace in the cache with its coverage.
pub fn list(cache_dir: &Path, out: &mut impl Write) -> Result<()> {
    let cache = open_existing(cache_dir)?;
    for signature in cache.signatures()? {
        match cache.entry_info(&signature) {
            Some(info) => writeln!(out, "{signature} {}", info.stored_count)?,
            None => writeln!(out, "{signature} unreadable")?,
        }
    }
    Ok(())
}

/// Show one namespace's metadata and check it against its segments.
///
/// Fails when the namespace is missing or its segments do not add up.
pub fn inspect(cache_dir: &Path, signature: &str, dump: bool, out: &mut impl Write) -> Result<()> {
    let signature: Signature = signature.parse()?;
    let cache = open_existing(cache_dir)?;
    let Some(info) = cache.entry_info(&signature) else {
        bail!("{signature}: no readable entry (missing or failed verification)");
    };
    writeln!(out, "signature     {signature}")?;
    writeln!(out, "stored_count  {}", info.stored_count)?;
    writeln!(out, "batches       {}", info.batches)?;
    match info.last_applied_job_id {
        Some(job) => writeln!(out, "last_job      {job}")?,
        None => writeln!(out, "last_job      -")?,
    }
    let trajectories = cache
        .read(&signature)
        .with_context(|| format!("{signature}: segments failed verification"))?;
    if trajectories.len() as u64 != info.stored_count {
        bail!(
            "{signature}: metadata records {} trajectories, segments hold {}",
            info.stored_count,
            trajectories.len()
        );
    }
    writeln!(out, "verified      ok")?;
    if dump {
        serde_json::to_writer_pretty(&mut *out, &trajectories)?;
        writeln!(out)?;
    }
    Ok(())
}

/// Sweep staged writes and unreferenced segments.
pub fn recover(cache_dir: &Path, out: &mut impl Write) -> Result<()> {
    let report = open_existing(cache_dir)?.recover()?;
    writeln!(
        out,
        "namespaces {} staged_removed {} orphans_removed {} corrupt {} unavailable {}",
        report.namespaces,
        report.staged_files_removed,
        report.orphan_segments_removed,
        report.corrupt_namespaces,
        report.unavailable_namespaces
    )?;
    Ok(())
}

/// Remove every workspace under `root`.
pub fn sweep(root: &Path, out: &mut impl Write) -> Result<()> {
    if !root.is_dir() {
        bail!("{} is not a directory", root.display());
    }
    let removed = WorkspaceRoot::open(root)?.sweep()?;
    writeln!(out, "removed {removed} workspace(s)")?;
    Ok(())
}

// `DiskTier::open` creates missing roots; an operator typo should not.
fn open_existing(cache_dir: &Path) -> Result<DiskTier> {
    if !cache_dir.is_dir() {
        bail!("{} is not a cache directory", cache_dir.display());
    }
    Ok(DiskTier::open(cache_dir)?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use ensemble_cache::{JobId, Trajectory};
    use serde_json::json;

    fn output(f: impl FnOnce(&mut Vec<u8>) -> Result<()>) -> Result<String> {
        let mut buf = Vec::new();
        f(&mut buf)?;
        Ok(String::from_utf8(buf).unwrap())
    }

    fn request_json(n: u64) -> serde_json::Value {
        json!({
            "model": {"name": "decay", "species": [{"name": "A", "initial_value": 100}]},
            "kwargs": {"number_of_trajectories": n, "seed": 7}
        })
    }

    #[test]
    fn signature_ignores_the_trajectory_count() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.json");
        let b = dir.path().join("b.json");
        std::fs::write(&a, request_json(10).to_string()).unwrap();
        std::fs::write(&b, request_json(25).to_string()).unwrap();

        let out_a = output(|o| signature(&a, o)).unwrap();
        let out_b = output(|o| signature(&b, o)).unwrap();
        let (sig_a, n_a) = out_a.trim().split_once(' ').unwrap();
        let (sig_b, n_b) = out_b.trim().split_once(' ').unwrap();
        assert_eq!(sig_a, sig_b);
        assert_eq!(sig_a.len(), 64);
        assert_eq!((n_a, n_b), ("10", "25"));
    }

    #[test]
    fn inspect_verifies_and_dumps() {
        let dir = tempfile::tempdir().unwrap();
        let sig = Signature([3; 32]);
        let cache = DiskTier::open(dir.path()).unwrap();
        let batch = vec![Trajectory(json!({"t": 0})), Trajectory(json!({"t": 1}))];
        cache.append(&sig, JobId::new(), &batch).unwrap();

        let text = output(|o| inspect(dir.path(), &sig.to_hex(), true, o)).unwrap();
        assert!(text.contains("stored_count  2"));
        assert!(text.contains("verified      ok"));
        assert!(text.contains("\"t\": 1"));

        let listing = output(|o| list(dir.path(), o)).unwrap();
        assert_eq!(listing.trim(), format!("{sig} 2"));
    }

    #[test]
    fn inspect_rejects_missing_entries_and_bad_signatures() {
        let dir = tempfile::tempdir().unwrap();
        let missing = Signature([4; 32]).to_hex();
        assert!(output(|o| inspect(dir.path(), &missing, false, o)).is_err());
        assert!(output(|o| inspect(dir.path(), "zz", false, o)).is_err());
        assert!(output(|o| list(&dir.path().join("nope"), o)).is_err());
    }

    #[test]
    fn recover_and_sweep_report_counts() {
        let dir = tempfile::tempdir().unwrap();
        let cache_dir = dir.path().join("cache");
        let sig = Signature([5; 32]);
        DiskTier::open(&cache_dir)
            .unwrap()
            .append(&sig, JobId::new(), &[Trajectory(json!(1))])
            .unwrap();
        let text = output(|o| recover(&cache_dir, o)).unwrap();
        assert!(text.starts_with("namespaces 1 staged_removed 0 orphans_removed 0"));

        let jobs = dir.path().join("jobs");
        std::fs::create_dir_all(jobs.join("a")).unwrap();
        std::fs::create_dir_all(jobs.join("b")).unwrap();
        let text = output(|o| sweep(&jobs, o)).unwrap();
        assert_eq!(text.trim(), "removed 2 workspace(s)");
        assert!(output(|o| sweep(&dir.path().join("missing"), o)).is_err());
    }
}
