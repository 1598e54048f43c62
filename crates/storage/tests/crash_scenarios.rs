//! Crash scenario matrix tests
//!
//! Tests covering crash recovery at the storage layer: interrupted saves,
//! corrupt generations, generation fallback, and recovery through the full
//! cache load path.

use mirror_core::{JsonCodec, Record, SaveCadence, StoreId, StoreMode, StoreParams, Timestamp};
use mirror_storage::{CachePaths, MirrorCache};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Telemetry {
    id: Uuid,
    created_at: Timestamp,
    expires_after_secs: i64,
    sequence_number: Option<u64>,
    channel: String,
    value: f64,
}

impl Record for Telemetry {
    fn id(&self) -> Uuid {
        self.id
    }
    fn set_id(&mut self, id: Uuid) {
        self.id = id;
    }
    fn created_at(&self) -> Timestamp {
        self.created_at
    }
    fn expires_after_secs(&self) -> i64 {
        self.expires_after_secs
    }
    fn sequence_number(&self) -> Option<u64> {
        self.sequence_number
    }
    fn set_sequence_number(&mut self, seq: Option<u64>) {
        self.sequence_number = seq;
    }
}

fn telemetry(channel: &str, value: f64) -> Telemetry {
    Telemetry {
        id: Uuid::new_v4(),
        created_at: Timestamp::now(),
        expires_after_secs: 0,
        sequence_number: None,
        channel: channel.to_string(),
        value,
    }
}

fn persistent_params() -> StoreParams {
    StoreParams {
        mode: StoreMode::Cached,
        persistent: true,
        track_insertion_order: true,
        save_cadence: SaveCadence::EveryMutations(1),
        ..StoreParams::default()
    }
}

fn open_cache(root: &Path) -> Arc<MirrorCache<Telemetry, JsonCodec<Telemetry>>> {
    Arc::new(
        MirrorCache::new(
            StoreId::from_raw("telemetry"),
            persistent_params(),
            Arc::new(JsonCodec::new()),
            Some(root),
            None,
        )
        .unwrap(),
    )
}

/// Populate a store, force-save it, and drop it.
fn create_store_with_data(root: &Path, count: usize) -> Vec<Uuid> {
    let cache = open_cache(root);
    let records: Vec<Telemetry> = (0..count)
        .map(|i| telemetry(&format!("ch{}", i), i as f64))
        .collect();
    let stored = cache.add_many(records).unwrap();
    cache.schedule_save(true, true);
    stored.iter().map(|r| r.id).collect()
}

// === Interrupted-save scenarios ===

#[test]
fn scenario_stale_pending_generation_is_quarantined() {
    let dir = tempdir().unwrap();
    let ids = create_store_with_data(dir.path(), 5);

    // A crash mid-save leaves a pending generation behind
    fs::write(dir.path().join("telemetry.0"), b"{ partial garbage").unwrap();

    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 5);
    for id in &ids {
        assert!(cache.get_by_id(*id).is_some());
    }

    // The pending file was moved aside, never read
    assert!(!dir.path().join("telemetry.0").exists());
    assert!(dir
        .path()
        .join("LostFound")
        .join("telemetry.corrupt")
        .exists());
}

#[test]
fn scenario_pending_generation_with_valid_content_still_ignored() {
    let dir = tempdir().unwrap();
    create_store_with_data(dir.path(), 2);

    // Even a syntactically valid pending file must not be trusted
    let decoy = serde_json::to_vec(&vec![telemetry("decoy", 0.0)]).unwrap();
    fs::write(dir.path().join("telemetry.0"), decoy).unwrap();

    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 2);
    assert!(cache.get_by_predicate(|r| r.channel == "decoy").is_none());
}

// === Generation fallback scenarios ===

#[test]
fn scenario_corrupt_current_recovers_from_backup() {
    let dir = tempdir().unwrap();

    let cache = open_cache(dir.path());
    cache.add_many(vec![telemetry("first", 1.0)]).unwrap();
    cache.schedule_save(true, true);
    cache.add_many(vec![telemetry("second", 2.0)]).unwrap();
    cache.schedule_save(true, true);
    drop(cache);

    // Corrupt the current generation; the backup holds the first save
    fs::write(dir.path().join("telemetry"), b"\xff\xfe not json").unwrap();

    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 1);
    assert!(cache.get_by_predicate(|r| r.channel == "first").is_some());
}

#[test]
fn scenario_truncated_current_recovers_from_backup() {
    let dir = tempdir().unwrap();

    let cache = open_cache(dir.path());
    cache.add_many(vec![telemetry("a", 1.0)]).unwrap();
    cache.schedule_save(true, true);
    cache.add_many(vec![telemetry("b", 2.0)]).unwrap();
    cache.schedule_save(true, true);
    drop(cache);

    // Truncate the current generation mid-record
    let path = dir.path().join("telemetry");
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();

    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 1);
}

#[test]
fn scenario_no_files_loads_empty() {
    let dir = tempdir().unwrap();
    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 0);
    assert!(cache.is_empty());
}

#[test]
fn scenario_both_generations_corrupt_starts_empty() {
    let dir = tempdir().unwrap();
    create_store_with_data(dir.path(), 3);

    fs::write(dir.path().join("telemetry"), b"bad").unwrap();
    fs::write(dir.path().join("telemetry.1"), b"worse").unwrap();

    // The cache logs the corruption and stays available, empty
    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 0);

    // And it can write fresh state over the wreckage
    cache.add_many(vec![telemetry("fresh", 9.0)]).unwrap();
    cache.schedule_save(true, true);
    drop(cache);

    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 1);
}

// === Round-trip durability ===

#[test]
fn scenario_roundtrip_preserves_records_and_sequences() {
    let dir = tempdir().unwrap();
    let ids = create_store_with_data(dir.path(), 20);

    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 20);

    for (i, id) in ids.iter().enumerate() {
        let record = cache.get_by_id(*id).unwrap();
        assert_eq!(record.sequence_number, Some(i as u64 + 1));
        assert_eq!(record.value, i as f64);
    }
}

#[test]
fn scenario_roundtrip_preserves_tombstone_offset() {
    let dir = tempdir().unwrap();

    let cache = open_cache(dir.path());
    let stored = cache
        .add_many(vec![
            telemetry("a", 1.0),
            telemetry("b", 2.0),
            telemetry("c", 3.0),
        ])
        .unwrap();
    // Removing the first record advances the offset past its slot
    cache.remove_by_id(stored[0].id);
    cache.schedule_save(true, true);
    drop(cache);

    let cache = open_cache(dir.path());
    assert_eq!(cache.load(), 2);

    // Sequence numbers continue from the persisted offset
    let fresh = cache.add_many(vec![telemetry("d", 4.0)]).unwrap();
    assert_eq!(fresh[0].sequence_number, Some(4));
}

// === Layout sanity ===

#[test]
fn scenario_generations_on_disk_after_two_saves() {
    let dir = tempdir().unwrap();

    let cache = open_cache(dir.path());
    cache.add_many(vec![telemetry("x", 1.0)]).unwrap();
    cache.schedule_save(true, true);
    cache.add_many(vec![telemetry("y", 2.0)]).unwrap();
    cache.schedule_save(true, true);

    let paths = CachePaths::new(dir.path());
    let current = paths.store_file(&StoreId::from_raw("telemetry"));
    assert!(current.exists());
    assert!(CachePaths::backup_file(&current).exists());
    assert!(!CachePaths::pending_file(&current).exists());
}
