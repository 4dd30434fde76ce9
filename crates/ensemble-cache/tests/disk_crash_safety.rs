// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Crash-safety and integrity drills for `DiskTier`.
//!
//! Each test fabricates the on-disk leftovers of a particular failure (a
//! crash mid-append, bit rot in metadata, a truncated segment) and checks the
//! store never serves partial data and never loses committed coverage.

#![allow(missing_docs)]
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use ensemble_cache::{CacheError, CacheStore, DiskTier, JobId, Signature, Trajectory};
use serde_json::json;

fn sig(byte: u8) -> Signature {
    Signature([byte; 32])
}

fn batch(len: u64) -> Vec<Trajectory> {
    (0..len).map(|i| Trajectory(json!({ "sample": i }))).collect()
}

fn namespace(root: &std::path::Path, signature: &Signature) -> PathBuf {
    root.join(signature.to_hex())
}

#[test]
fn uncommitted_segment_is_invisible_and_swept() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskTier::open(dir.path()).unwrap();
    store.append(&sig(1), JobId::new(), &batch(10)).unwrap();

    // Crash after the segment rename, before meta.json was replaced.
    let ns = namespace(dir.path(), &sig(1));
    fs::write(ns.join("segments/00000001.cbor"), b"half-written batch").unwrap();
    // Crash while staging.
    fs::create_dir_all(ns.join(".tmp")).unwrap();
    fs::write(ns.join(".tmp/abc.tmp"), b"partial").unwrap();

    let reopened = DiskTier::open(dir.path()).unwrap();
    assert_eq!(reopened.stored_count(&sig(1)), 10);
    assert_eq!(reopened.read(&sig(1)).unwrap().len(), 10);

    let report = reopened.recover().unwrap();
    assert_eq!(report.namespaces, 1);
    assert_eq!(report.staged_files_removed, 1);
    assert_eq!(report.orphan_segments_removed, 1);
    assert_eq!(report.corrupt_namespaces, 0);
    assert!(!ns.join("segments/00000001.cbor").exists());
    assert!(ns.join("segments/00000000.cbor").exists());

    // The next append reuses the swept sequence number cleanly.
    reopened.append(&sig(1), JobId::new(), &batch(5)).unwrap();
    assert_eq!(reopened.read(&sig(1)).unwrap().len(), 15);
}

#[test]
fn namespace_without_metadata_is_absent_and_swept() {
    let dir = tempfile::tempdir().unwrap();
    let ns = namespace(dir.path(), &sig(2));
    fs::create_dir_all(ns.join("segments")).unwrap();
    fs::write(ns.join("segments/00000000.cbor"), b"never committed").unwrap();

    let store = DiskTier::open(dir.path()).unwrap();
    assert_eq!(store.stored_count(&sig(2)), 0);
    assert!(matches!(store.read(&sig(2)), Err(CacheError::NotFound { .. })));

    let report = store.recover().unwrap();
    assert_eq!(report.orphan_segments_removed, 1);
}

#[test]
fn checksum_mismatch_reads_as_not_found() {
    let dir = tempfile::tempdir().unwrap();
    DiskTier::open(dir.path())
        .unwrap()
        .append(&sig(3), JobId::new(), &batch(4))
        .unwrap();

    let meta_path = namespace(dir.path(), &sig(3)).join("meta.json");
    let tampered = fs::read_to_string(&meta_path)
        .unwrap()
        .replace("\"stored_count\": 4", "\"stored_count\": 40");
    fs::write(&meta_path, tampered).unwrap();

    let store = DiskTier::open(dir.path()).unwrap();
    assert!(store.entry_info(&sig(3)).is_none());
    assert!(!store.is_ready(&sig(3), 1));
    assert!(matches!(store.read(&sig(3)), Err(CacheError::NotFound { .. })));
    assert_eq!(store.recover().unwrap().corrupt_namespaces, 1);
}

#[test]
fn damaged_segment_is_never_served() {
    let dir = tempfile::tempdir().unwrap();
    DiskTier::open(dir.path())
        .unwrap()
        .append(&sig(4), JobId::new(), &batch(6))
        .unwrap();
    let segment = namespace(dir.path(), &sig(4)).join("segments/00000000.cbor");
    let mut bytes = fs::read(&segment).unwrap();
    bytes.truncate(bytes.len() / 2);
    fs::write(&segment, bytes).unwrap();

    let store = DiskTier::open(dir.path()).unwrap();
    // Coverage equivalence: no readable data, so no coverage either.
    assert_eq!(store.stored_count(&sig(4)), 0);
    assert!(matches!(store.read(&sig(4)), Err(CacheError::NotFound { .. })));
}

#[test]
fn briefly_missing_segment_never_costs_coverage() {
    let dir = tempfile::tempdir().unwrap();
    DiskTier::open(dir.path())
        .unwrap()
        .append(&sig(8), JobId::new(), &batch(10))
        .unwrap();
    let segment = namespace(dir.path(), &sig(8)).join("segments/00000000.cbor");
    let aside = dir.path().join("00000000.cbor.moved");

    let store = DiskTier::open(dir.path()).unwrap();
    fs::rename(&segment, &aside).unwrap();
    assert_eq!(store.stored_count(&sig(8)), 0);
    assert!(matches!(store.read(&sig(8)), Err(CacheError::Io { .. })));
    assert!(matches!(
        store.append(&sig(8), JobId::new(), &batch(1)),
        Err(CacheError::Io { .. })
    ));
    assert_eq!(store.recover().unwrap().unavailable_namespaces, 1);

    fs::rename(&aside, &segment).unwrap();
    assert_eq!(store.stored_count(&sig(8)), 10);
    store.append(&sig(8), JobId::new(), &batch(5)).unwrap();
    assert_eq!(store.stored_count(&sig(8)), 15);
    assert!(segment.exists());
    assert_eq!(store.read(&sig(8)).unwrap().len(), 15);
}

#[test]
fn corrupt_namespace_restarts_on_next_append() {
    let dir = tempfile::tempdir().unwrap();
    let ns = namespace(dir.path(), &sig(5));
    fs::create_dir_all(&ns).unwrap();
    fs::write(ns.join("meta.json"), b"{ not json").unwrap();

    let store = DiskTier::open(dir.path()).unwrap();
    assert_eq!(store.stored_count(&sig(5)), 0);
    store.append(&sig(5), JobId::new(), &batch(3)).unwrap();
    assert_eq!(store.read(&sig(5)).unwrap().len(), 3);

    let reopened = DiskTier::open(dir.path()).unwrap();
    assert_eq!(reopened.stored_count(&sig(5)), 3);
}

#[test]
fn concurrent_appends_to_one_signature_do_not_interleave() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DiskTier::open(dir.path()).unwrap());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || store.append(&sig(6), JobId::new(), &batch(3)).unwrap())
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(store.stored_count(&sig(6)), 24);
    let info = store.entry_info(&sig(6)).unwrap();
    assert_eq!(info.batches, 8);

    let reopened = DiskTier::open(dir.path()).unwrap();
    assert_eq!(reopened.read(&sig(6)).unwrap().len(), 24);
}

#[test]
fn coverage_never_decreases_across_appends() {
    let dir = tempfile::tempdir().unwrap();
    let store = DiskTier::open(dir.path()).unwrap();
    let mut last = 0;
    for len in [0, 3, 0, 7, 1] {
        let job = JobId::new();
        let after = store.append(&sig(7), job, &batch(len)).unwrap().stored_count();
        assert!(after >= last);
        assert_eq!(after, last + len);
        // Redelivery of the same job leaves coverage where it was.
        assert_eq!(store.append(&sig(7), job, &batch(len)).unwrap().stored_count(), after);
        last = after;
    }
    assert_eq!(store.read(&sig(7)).unwrap().len() as u64, last);
}
