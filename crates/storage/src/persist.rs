//! Cache-file persistence: save, load, recovery
//!
//! One engine instance exclusively owns the on-disk file set for one store.
//! Writes are serialized by a per-store save mutex, and every disk touch is
//! registered with the process-wide in-flight write tracker.
//!
//! ## Generations
//!
//! Safe-save stores keep up to three generations of the cache file:
//! `<path>` (current), `<path>.1` (previous), and `<path>.0` (transient
//! pending write). The pending file exists only mid-save; finding one at
//! load time means a save was interrupted, so it is quarantined to
//! `LostFound/` and never read.
//!
//! ## File format
//!
//! UTF-8 JSON. Either a bare array of record objects, or
//! `{"SequenceNumberOffset": <u64>, "Records": [...]}` when insertion-order
//! tracking is enabled, with `null` slots preserving tombstones. Encrypted
//! stores pass the whole serialized blob through the cipher. The loader
//! accepts both shapes, probing with a header sniff before falling back to
//! trying the other shape.

use crate::cipher::Cipher;
use crate::paths::CachePaths;
use crate::shutdown;
use mirror_core::{Error, Record, RecordCodec, Result, SaveCadence, StoreId, StoreParams};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Header prefix identifying the sequenced file shape.
const SEQUENCED_HEADER: &[u8] = b"{\"SequenceNumberOffset";

/// How far back from the end of an append file the closing `]` is searched.
const SPLICE_TAIL_BYTES: u64 = 256;

/// Snapshot of a store's content handed to the engine for serialization.
pub enum CachePayload<T> {
    /// Plain record set (no insertion-order tracking)
    Bare(Vec<T>),
    /// Sequence-tracked set: rolling offset plus slots, `None` = tombstone
    Sequenced {
        /// The index's rolling offset at snapshot time
        offset: u64,
        /// Live and tombstoned slots in sequence order
        records: Vec<Option<T>>,
    },
}

impl<T> CachePayload<T> {
    /// Live record count in the payload.
    pub fn live_len(&self) -> usize {
        match self {
            CachePayload::Bare(records) => records.len(),
            CachePayload::Sequenced { records, .. } => {
                records.iter().filter(|slot| slot.is_some()).count()
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SequencedFile {
    #[serde(rename = "SequenceNumberOffset")]
    sequence_number_offset: u64,
    #[serde(rename = "Records")]
    records: Vec<Option<serde_json::Value>>,
}

/// One rotated append-only file and the first sequence number it holds.
#[derive(Debug, Clone)]
pub struct RotatedFile {
    /// Absolute file path
    pub path: PathBuf,
    /// Sequence number of the first record appended to this file
    pub first_sequence: u64,
}

/// Supplies seed records written at the head of each new rotated file.
pub type BaselineFn<T> = Box<dyn Fn() -> Vec<T> + Send + Sync>;

/// Per-store persistence engine.
pub struct PersistenceEngine<T, C> {
    store_id: StoreId,
    paths: CachePaths,
    params: StoreParams,
    codec: Arc<C>,
    cipher: Option<Arc<dyn Cipher>>,
    save_mutex: Mutex<()>,
    mutations_since_save: AtomicU32,
    last_save: Mutex<Option<Instant>>,
    rotated: Mutex<Vec<RotatedFile>>,
    baseline: Mutex<Option<BaselineFn<T>>>,
}

impl<T, C> PersistenceEngine<T, C>
where
    T: Record,
    C: RecordCodec<T>,
{
    /// Create an engine for one store's file set, creating the cache
    /// directories as needed.
    pub fn new(
        store_id: StoreId,
        paths: CachePaths,
        params: StoreParams,
        codec: Arc<C>,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        paths.ensure_dirs()?;
        Ok(PersistenceEngine {
            store_id,
            paths,
            params,
            codec,
            cipher,
            save_mutex: Mutex::new(()),
            mutations_since_save: AtomicU32::new(0),
            last_save: Mutex::new(None),
            rotated: Mutex::new(Vec::new()),
            baseline: Mutex::new(None),
        })
    }

    /// Record that `n` mutations occurred since the last save.
    pub fn note_mutations(&self, n: u32) {
        self.mutations_since_save.fetch_add(n, Ordering::Relaxed);
    }

    /// Whether a pending save has become due under the configured cadence.
    pub fn save_due(&self) -> bool {
        match self.params.save_cadence {
            SaveCadence::Interval(interval) => self
                .last_save
                .lock()
                .map_or(true, |at| at.elapsed() >= interval),
            SaveCadence::EveryMutations(n) => {
                self.mutations_since_save.load(Ordering::Relaxed) >= n
            }
        }
    }

    /// Register the baseline-records callback for rotated files.
    pub fn set_baseline(&self, baseline: BaselineFn<T>) {
        *self.baseline.lock() = Some(baseline);
    }

    /// Write a snapshot to the store's cache file.
    ///
    /// Returns `Ok(false)` when the save was skipped by rate limiting:
    /// below the mutation-count threshold, or a conflicting writer holds the
    /// lock and the store is not in safe-save mode (losing one non-critical
    /// snapshot is preferred over contending with the writer). `force`
    /// bypasses both checks. At most one save runs per store at a time.
    pub fn save(&self, payload: &CachePayload<T>, force: bool, lock_busy: bool) -> Result<bool> {
        if !force {
            if let SaveCadence::EveryMutations(n) = self.params.save_cadence {
                if self.mutations_since_save.load(Ordering::Relaxed) < n {
                    debug!(store = %self.store_id, "save below mutation threshold, skipped");
                    return Ok(false);
                }
            }
            if lock_busy && !self.params.safe_save {
                debug!(store = %self.store_id, "writer active, skipping save");
                return Ok(false);
            }
        }

        let _save = self.save_mutex.lock();
        let _write = shutdown::begin_write();

        let bytes = self.serialize(payload)?;
        let path = self.paths.store_file(&self.store_id);

        if self.params.safe_save {
            let pending = CachePaths::pending_file(&path);
            let backup = CachePaths::backup_file(&path);

            fs::write(&pending, &bytes)?;
            if path.exists() {
                let _ = fs::remove_file(&backup);
                fs::rename(&path, &backup)?;
            }
            fs::rename(&pending, &path)?;
        } else {
            fs::write(&path, &bytes)?;
        }

        self.mutations_since_save.store(0, Ordering::Relaxed);
        *self.last_save.lock() = Some(Instant::now());
        debug!(store = %self.store_id, records = payload.live_len(), "cache file saved");
        Ok(true)
    }

    /// Load the store's cache file, falling back through generations.
    ///
    /// A stale pending generation is quarantined unread. The current
    /// generation is parsed first; on failure the previous generation is
    /// tried. A store with no file at all loads successfully empty.
    pub fn load(&self) -> Result<CachePayload<T>> {
        let path = self.paths.store_file(&self.store_id);
        let pending = CachePaths::pending_file(&path);
        if pending.exists() {
            self.quarantine(&pending);
        }

        match self.read_and_parse(&path) {
            Ok(Some(payload)) => return Ok(payload),
            Ok(None) => {}
            Err(e) => {
                warn!(store = %self.store_id, error = %e, "current generation unreadable, trying backup");
            }
        }

        let backup = CachePaths::backup_file(&path);
        match self.read_and_parse(&backup) {
            Ok(Some(payload)) => {
                info!(store = %self.store_id, "recovered from backup generation");
                Ok(payload)
            }
            Ok(None) if !path.exists() => Ok(CachePayload::Bare(Vec::new())),
            Ok(None) => Err(Error::Corrupt(format!(
                "{}: current generation unreadable and no backup exists",
                self.store_id
            ))),
            Err(e) => Err(Error::Corrupt(format!(
                "{}: both generations unreadable: {}",
                self.store_id, e
            ))),
        }
    }

    /// Append records to the newest rotated file, rotating on size and
    /// deleting the oldest file beyond the count bound.
    ///
    /// Returns the first retained sequence number when the oldest file was
    /// deleted, so a sequence-tracked caller can trim its index to match.
    pub fn append(&self, records: &[T]) -> Result<Option<u64>> {
        let Some(first) = records.first() else {
            return Ok(None);
        };
        let first_sequence = first.sequence_number().unwrap_or(1);

        let _save = self.save_mutex.lock();
        let _write = shutdown::begin_write();

        let mut rotated = self.rotated.lock();

        if let Some(current) = rotated.last() {
            let size = fs::metadata(&current.path).map(|m| m.len()).unwrap_or(0);
            if size <= self.params.max_file_size_kb.saturating_mul(1024) {
                let items = self.encode_items(records)?;
                self.splice_items(&current.path, &items)?;
                return Ok(None);
            }
        }

        // Start a new file, seeded with baseline records when configured
        let baseline = self.baseline.lock().as_ref().map(|f| f()).unwrap_or_default();
        let mut items = self.encode_items(&baseline)?;
        items.extend(self.encode_items(records)?);

        let mut path = self.paths.rotated_file(&self.store_id, chrono::Utc::now());
        // Second-resolution names collide under rapid rotation
        let mut discriminator = 1u32;
        while path.exists() {
            path = PathBuf::from(format!(
                "{}_{}",
                self.paths
                    .rotated_file(&self.store_id, chrono::Utc::now())
                    .display(),
                discriminator
            ));
            discriminator += 1;
        }
        fs::write(&path, format!("[{}]", items.join(",")))?;
        info!(store = %self.store_id, path = %path.display(), "rotated to new append file");
        rotated.push(RotatedFile {
            path,
            first_sequence,
        });

        if rotated.len() > self.params.max_file_count {
            let oldest = rotated.remove(0);
            if let Err(e) = fs::remove_file(&oldest.path) {
                warn!(path = %oldest.path.display(), error = %e, "failed to delete rotated file");
            } else {
                info!(path = %oldest.path.display(), "deleted oldest append file");
            }
            return Ok(Some(rotated[0].first_sequence));
        }

        Ok(None)
    }

    /// Delete rotated files fully below an advanced trim point.
    ///
    /// A file becomes eligible once the trim point has passed the first
    /// sequence of the *next* file.
    pub fn apply_trim(&self, trim_seq: u64) {
        let mut rotated = self.rotated.lock();
        while rotated.len() > 1 && rotated[1].first_sequence <= trim_seq + 1 {
            let oldest = rotated.remove(0);
            if let Err(e) = fs::remove_file(&oldest.path) {
                warn!(path = %oldest.path.display(), error = %e, "failed to delete trimmed file");
            } else {
                debug!(path = %oldest.path.display(), trim_seq, "deleted fully-trimmed append file");
            }
        }
    }

    /// Load every rotated file in creation order, rebuilding the
    /// file → first-sequence map with contiguous numbering from 1.
    ///
    /// Unreadable files are logged and skipped; the store remains available.
    pub fn load_append(&self) -> Result<Vec<T>> {
        let files = self.paths.list_rotated_files(&self.store_id)?;
        let mut all = Vec::new();
        let mut rotated = Vec::new();
        let mut next_sequence = 1u64;

        for path in files {
            match self.read_append_file(&path) {
                Ok(records) => {
                    rotated.push(RotatedFile {
                        path,
                        first_sequence: next_sequence,
                    });
                    next_sequence += records.len() as u64;
                    all.extend(records);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable append file");
                }
            }
        }

        *self.rotated.lock() = rotated;
        Ok(all)
    }

    /// Remove every on-disk file for this store (all generations, rotated
    /// files) and reset the engine's counters. Used by `Reset`.
    pub fn delete_files(&self) -> Result<()> {
        let _save = self.save_mutex.lock();

        let path = self.paths.store_file(&self.store_id);
        for p in [
            path.clone(),
            CachePaths::pending_file(&path),
            CachePaths::backup_file(&path),
        ] {
            if let Err(e) = fs::remove_file(&p) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %p.display(), error = %e, "failed to delete cache file");
                }
            }
        }

        let mut rotated = self.rotated.lock();
        for file in rotated.drain(..) {
            if let Err(e) = fs::remove_file(&file.path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %file.path.display(), error = %e, "failed to delete rotated file");
                }
            }
        }

        self.mutations_since_save.store(0, Ordering::Relaxed);
        *self.last_save.lock() = None;
        Ok(())
    }

    /// The rotated-file map, oldest first.
    pub fn rotated_files(&self) -> Vec<RotatedFile> {
        self.rotated.lock().clone()
    }

    // ------------------------------------------------------------------
    // Serialization
    // ------------------------------------------------------------------

    fn serialize(&self, payload: &CachePayload<T>) -> Result<Vec<u8>> {
        // SequencedFile is serialized directly (not via a Value) so the
        // offset field stays first and the load-time header sniff works
        let bytes = match payload {
            CachePayload::Bare(records) => {
                let encoded: Result<Vec<_>> =
                    records.iter().map(|r| self.codec.encode(r)).collect();
                serde_json::to_vec(&serde_json::Value::Array(encoded?))?
            }
            CachePayload::Sequenced { offset, records } => {
                let encoded: Result<Vec<Option<serde_json::Value>>> = records
                    .iter()
                    .map(|slot| slot.as_ref().map(|r| self.codec.encode(r)).transpose())
                    .collect();
                serde_json::to_vec(&SequencedFile {
                    sequence_number_offset: *offset,
                    records: encoded?,
                })?
            }
        };

        match (&self.cipher, self.params.encrypted) {
            (Some(cipher), true) => cipher.encrypt(&bytes),
            _ => Ok(bytes),
        }
    }

    fn read_and_parse(&self, path: &Path) -> Result<Option<CachePayload<T>>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        self.parse(&raw).map(Some)
    }

    fn parse(&self, raw: &[u8]) -> Result<CachePayload<T>> {
        let plain = match (&self.cipher, self.params.encrypted) {
            (Some(cipher), true) => cipher.decrypt(raw)?,
            _ => raw.to_vec(),
        };

        let start = plain
            .iter()
            .position(|b| !b.is_ascii_whitespace())
            .unwrap_or(0);
        let body = &plain[start..];

        if body.starts_with(SEQUENCED_HEADER) {
            self.parse_sequenced(body)
        } else {
            self.parse_bare(body)
                .or_else(|_| self.parse_sequenced(body))
        }
    }

    fn parse_bare(&self, body: &[u8]) -> Result<CachePayload<T>> {
        let values: Vec<serde_json::Value> = serde_json::from_slice(body)?;
        let records: Result<Vec<T>> = values.into_iter().map(|v| self.codec.decode(v)).collect();
        Ok(CachePayload::Bare(records?))
    }

    fn parse_sequenced(&self, body: &[u8]) -> Result<CachePayload<T>> {
        let file: SequencedFile = serde_json::from_slice(body)?;
        let records: Result<Vec<Option<T>>> = file
            .records
            .into_iter()
            .map(|slot| slot.map(|v| self.codec.decode(v)).transpose())
            .collect();
        Ok(CachePayload::Sequenced {
            offset: file.sequence_number_offset,
            records: records?,
        })
    }

    // ------------------------------------------------------------------
    // Quarantine
    // ------------------------------------------------------------------

    fn quarantine(&self, pending: &Path) {
        let target = self.paths.quarantine_file(
            &self.store_id,
            self.params.verbose_quarantine,
            chrono::Utc::now(),
        );
        let _ = fs::create_dir_all(self.paths.lost_found_dir());
        let _ = fs::remove_file(&target);
        match fs::rename(pending, &target) {
            Ok(()) => warn!(
                store = %self.store_id,
                quarantined = %target.display(),
                "interrupted save detected, pending generation quarantined"
            ),
            Err(e) => warn!(
                store = %self.store_id,
                error = %e,
                "failed to quarantine pending generation"
            ),
        }
    }

    // ------------------------------------------------------------------
    // Append-file encoding and splicing
    // ------------------------------------------------------------------

    fn encode_items(&self, records: &[T]) -> Result<Vec<String>> {
        records
            .iter()
            .map(|record| {
                let value = self.codec.encode(record)?;
                match (&self.cipher, self.params.encrypted) {
                    (Some(cipher), true) => {
                        let encrypted = cipher.encrypt(&serde_json::to_vec(&value)?)?;
                        let b64 = base64_encode(&encrypted);
                        Ok(serde_json::to_string(&b64)?)
                    }
                    _ => Ok(serde_json::to_string(&value)?),
                }
            })
            .collect()
    }

    fn read_append_file(&self, path: &Path) -> Result<Vec<T>> {
        let raw = fs::read(path)?;
        let values: Vec<serde_json::Value> = serde_json::from_slice(&raw)?;

        values
            .into_iter()
            .map(|value| match (&self.cipher, self.params.encrypted) {
                (Some(cipher), true) => {
                    let b64 = value
                        .as_str()
                        .ok_or_else(|| Error::Corrupt("expected base64 string".to_string()))?;
                    let encrypted = base64_decode(b64)?;
                    let plain = cipher.decrypt(&encrypted)?;
                    self.codec.decode(serde_json::from_slice(&plain)?)
                }
                _ => self.codec.decode(value),
            })
            .collect()
    }

    /// Splice items into an existing JSON array file: seek to the closing
    /// `]`, overwrite with `,<items>]` (or `<items>]` when the array is
    /// still empty), and truncate any old tail.
    fn splice_items(&self, path: &Path, items: &[String]) -> Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let tail_len = len.min(SPLICE_TAIL_BYTES);

        let mut tail = vec![0u8; tail_len as usize];
        file.seek(SeekFrom::Start(len - tail_len))?;
        file.read_exact(&mut tail)?;

        let rel = tail
            .iter()
            .rposition(|&b| b == b']')
            .ok_or_else(|| Error::Corrupt(format!("{}: no closing bracket", path.display())))?;
        let pos = len - tail_len + rel as u64;

        let array_empty = tail[..rel]
            .iter()
            .rev()
            .find(|b| !b.is_ascii_whitespace())
            .map_or(true, |&b| b == b'[');

        let joined = items.join(",");
        let insert = if array_empty {
            format!("{}]", joined)
        } else {
            format!(",{}]", joined)
        };

        file.seek(SeekFrom::Start(pos))?;
        file.write_all(insert.as_bytes())?;
        file.set_len(pos + insert.len() as u64)?;
        Ok(())
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| Error::Corrupt(format!("invalid base64: {}", e)))
}
