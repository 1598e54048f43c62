//! Store identity and configuration
//!
//! A store is a named, typed collection of records with a persistence and
//! query policy. Its identity is a content-derived fingerprint of the record
//! schema (optionally suffixed with a friendly table name), so two nodes
//! holding the same record type resolve to the same store id without
//! coordination.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use xxhash_rust::xxh3::xxh3_64;

/// Content-derived store identifier.
///
/// Derived from the codec's schema string; stable across runs and processes
/// for the same record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId(String);

impl StoreId {
    /// Derive a store id from a schema description, optionally suffixed
    /// with a table name.
    pub fn derive(schema: &str, table: Option<&str>) -> Self {
        let fingerprint = xxh3_64(schema.as_bytes());
        match table {
            Some(t) => StoreId(format!("{:016x}_{}", fingerprint, t)),
            None => StoreId(format!("{:016x}", fingerprint)),
        }
    }

    /// Wrap a raw, externally-assigned store id.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        StoreId(raw.into())
    }

    /// The id as a string key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe form: every character outside `[A-Za-z0-9._-]`
    /// is replaced with `_`.
    pub fn sanitized(&self) -> String {
        self.0
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How records of a store are held and mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// In-memory map only; optionally persisted as a whole
    RamOnly,
    /// In-memory map backed by a cache file
    Cached,
    /// Rotating append-only log files; no full in-memory record map
    AppendOnly,
    /// Mirrored from a remote storage service
    RemoteBacked,
}

impl StoreMode {
    /// Whether queries and mutations are served from local memory.
    pub fn is_local(&self) -> bool {
        !matches!(self, StoreMode::RemoteBacked)
    }

    /// Whether the store keeps a full id-keyed record map in memory.
    pub fn keeps_record_map(&self) -> bool {
        !matches!(self, StoreMode::AppendOnly)
    }
}

/// When asynchronous saves become due.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveCadence {
    /// At most one save per interval
    Interval(Duration),
    /// A save becomes due after this many mutations
    EveryMutations(u32),
}

impl Default for SaveCadence {
    fn default() -> Self {
        SaveCadence::Interval(Duration::from_secs(30))
    }
}

/// Per-store configuration.
///
/// Plain data; construct with struct-update syntax over `Default`.
#[derive(Debug, Clone)]
pub struct StoreParams {
    /// Storage/mirroring mode
    pub mode: StoreMode,
    /// Whether the store writes cache files at all
    pub persistent: bool,
    /// Whether cache files pass through the configured cipher
    pub encrypted: bool,
    /// Bound on live record count; eviction removes the oldest overflow
    pub max_record_count: Option<u32>,
    /// Store-level retention: records older than this are retired
    pub max_age_secs: Option<i64>,
    /// Save rate limiting
    pub save_cadence: SaveCadence,
    /// Assign contiguous sequence numbers in insertion order
    pub track_insertion_order: bool,
    /// Write-rename durability with one retained prior generation
    pub safe_save: bool,
    /// Clear the cache when a save fails with an allocation-class error
    pub flush_on_out_of_memory: bool,
    /// Timestamp quarantined files instead of keeping one rolling file
    pub verbose_quarantine: bool,
    /// Append-only: rotate to a new file beyond this size
    pub max_file_size_kb: u64,
    /// Append-only: delete the oldest file beyond this count
    pub max_file_count: usize,
    /// Friendly table name, registered as an extra lookup key
    pub table_name: Option<String>,
    /// Background sweep interval (TTL, retention, due saves)
    pub sweep_interval: Duration,
    /// Bound on a single lock acquisition attempt before retrying
    pub lock_timeout: Duration,
    /// Deadline for correlated remote requests
    pub remote_timeout: Duration,
    /// Fire update notifications to registered listeners
    pub update_notifications: bool,
}

impl Default for StoreParams {
    fn default() -> Self {
        StoreParams {
            mode: StoreMode::RamOnly,
            persistent: false,
            encrypted: false,
            max_record_count: None,
            max_age_secs: None,
            save_cadence: SaveCadence::default(),
            track_insertion_order: false,
            safe_save: true,
            flush_on_out_of_memory: false,
            verbose_quarantine: false,
            max_file_size_kb: 512,
            max_file_count: 4,
            table_name: None,
            sweep_interval: Duration::from_secs(1),
            lock_timeout: Duration::from_millis(250),
            remote_timeout: Duration::from_secs(10),
            update_notifications: true,
        }
    }
}
