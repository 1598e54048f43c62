//! The mirror cache: one store's in-memory record set
//!
//! A concurrent map keyed by record id, optionally paired with a
//! [`SequenceIndex`] for insertion-order tracking, wrapped around a
//! [`PersistenceEngine`] for durability. All mutation paths take the write
//! lock; multi-record operations are followed by a single coalesced
//! persistence call, never one per record.
//!
//! AppendOnly stores keep no full record map: records live in the sequence
//! index only, durability goes through the append path, and reads scan the
//! index.
//!
//! Persistence snapshots are taken under a *read* lock so concurrent readers
//! keep running during serialization; the snapshot races with concurrent
//! writers and is eventually consistent.

use crate::cipher::Cipher;
use crate::paths::CachePaths;
use crate::persist::{BaselineFn, CachePayload, PersistenceEngine};
use crate::sequence::SequenceIndex;
use crate::sweeper::Sweeper;
use mirror_core::{Error, Record, RecordCodec, Result, StoreId, StoreParams, Timestamp};
use mirror_concurrency::UpgradeLock;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

/// A change notification delivered to registered listeners.
#[derive(Debug, Clone)]
pub enum CacheUpdate<T> {
    /// Records inserted
    Added(Vec<T>),
    /// Records replaced in place
    Updated(Vec<T>),
    /// Records removed by id or evicted over capacity
    Removed(Vec<T>),
    /// Records retired by TTL or store-level age retention
    Expired(Vec<T>),
    /// The whole store was cleared
    Cleared,
}

impl<T> CacheUpdate<T> {
    fn is_empty(&self) -> bool {
        match self {
            CacheUpdate::Added(r) | CacheUpdate::Updated(r) => r.is_empty(),
            CacheUpdate::Removed(r) | CacheUpdate::Expired(r) => r.is_empty(),
            CacheUpdate::Cleared => false,
        }
    }
}

/// Listener invoked after every successful mutation.
pub type UpdateListener<T> = Box<dyn Fn(&CacheUpdate<T>) + Send + Sync>;

struct CacheInner<T> {
    records: HashMap<Uuid, T>,
    index: Option<SequenceIndex<T>>,
}

/// One store's record cache.
pub struct MirrorCache<T: Record, C: RecordCodec<T>> {
    store_id: StoreId,
    params: StoreParams,
    lock: UpgradeLock<CacheInner<T>>,
    engine: Option<Arc<PersistenceEngine<T, C>>>,
    listeners: Mutex<Vec<UpdateListener<T>>>,
    pending_saves: AtomicU64,
    force_pending: AtomicBool,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<T, C> MirrorCache<T, C>
where
    T: Record,
    C: RecordCodec<T>,
{
    /// Create a cache for one store.
    ///
    /// `cache_root` is required for persistent stores; the engine owns the
    /// file set under it.
    pub fn new(
        store_id: StoreId,
        params: StoreParams,
        codec: Arc<C>,
        cache_root: Option<&Path>,
        cipher: Option<Arc<dyn Cipher>>,
    ) -> Result<Self> {
        let engine = if params.persistent {
            let root = cache_root.ok_or_else(|| {
                Error::InvalidOperation(format!("{}: persistent store needs a cache root", store_id))
            })?;
            Some(Arc::new(PersistenceEngine::new(
                store_id.clone(),
                CachePaths::new(root),
                params.clone(),
                codec,
                cipher,
            )?))
        } else {
            None
        };

        // AppendOnly always needs the index: it is the only in-memory view
        let tracked = params.track_insertion_order || !params.mode.keeps_record_map();
        let inner = CacheInner {
            records: HashMap::new(),
            index: tracked.then(SequenceIndex::new),
        };

        Ok(MirrorCache {
            lock: UpgradeLock::with_timeout(
                format!("cache:{}", store_id),
                inner,
                params.lock_timeout,
            ),
            store_id,
            params,
            engine,
            listeners: Mutex::new(Vec::new()),
            pending_saves: AtomicU64::new(0),
            force_pending: AtomicBool::new(false),
            sweeper: Mutex::new(None),
        })
    }

    /// The store this cache belongs to.
    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// The store's configuration.
    pub fn params(&self) -> &StoreParams {
        &self.params
    }

    /// Load persisted content into memory.
    ///
    /// Load failures are logged and leave the store empty but available:
    /// in-memory state is authoritative from here on. Returns the number of
    /// records loaded.
    pub fn load(&self) -> usize {
        let Some(engine) = &self.engine else {
            return 0;
        };

        if !self.params.mode.keeps_record_map() {
            match engine.load_append() {
                Ok(records) => {
                    let count = records.len();
                    self.lock.write(|inner| {
                        inner.index = Some(SequenceIndex::from_parts(
                            0,
                            records.into_iter().map(Some).collect(),
                        ));
                    });
                    return count;
                }
                Err(e) => {
                    warn!(store = %self.store_id, error = %e, "append load failed, starting empty");
                    return 0;
                }
            }
        }

        match engine.load() {
            Ok(CachePayload::Sequenced { offset, records }) => self.lock.write(|inner| {
                let index = SequenceIndex::from_parts(offset, records);
                inner.records = index
                    .iter_live()
                    .map(|record| (record.id(), record.clone()))
                    .collect();
                let count = inner.records.len();
                if inner.index.is_some() {
                    inner.index = Some(index);
                }
                count
            }),
            Ok(CachePayload::Bare(records)) => self.lock.write(|inner| {
                for record in records {
                    if let Some(index) = inner.index.as_mut() {
                        let mut copy = record.clone();
                        if let Ok(seq) = index.append(record.clone()) {
                            copy.set_sequence_number(Some(seq));
                        }
                        inner.records.insert(copy.id(), copy);
                    } else {
                        inner.records.insert(record.id(), record);
                    }
                }
                inner.records.len()
            }),
            Err(e) => {
                warn!(store = %self.store_id, error = %e, "load failed, starting empty");
                0
            }
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Insert or replace one record by id, assigning a fresh id when nil.
    /// Returns the stored record (with id and sequence number assigned).
    pub fn add_or_update(&self, record: T) -> Result<T> {
        let mut stored = self.upsert_many(vec![record], false)?;
        stored
            .pop()
            .ok_or_else(|| Error::InvalidOperation("empty upsert".to_string()))
    }

    /// Insert or replace a batch; one coalesced save, one notification.
    pub fn add_many(&self, records: Vec<T>) -> Result<Vec<T>> {
        self.upsert_many(records, false)
    }

    /// Batch update (insert-or-replace); notifies `Updated`.
    pub fn update_many(&self, records: Vec<T>) -> Result<Vec<T>> {
        self.upsert_many(records, true)
    }

    fn upsert_many(&self, records: Vec<T>, as_update: bool) -> Result<Vec<T>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let keeps_map = self.params.mode.keeps_record_map();

        let stored: Result<Vec<T>> = self.lock.write(|inner| {
            records
                .into_iter()
                .map(|mut record| {
                    if record.id().is_nil() {
                        record.set_id(Uuid::new_v4());
                    }
                    let id = record.id();

                    if let Some(index) = inner.index.as_mut() {
                        let exists = if keeps_map {
                            inner.records.contains_key(&id)
                        } else {
                            index.get_by_id(id).is_some()
                        };
                        if exists {
                            index.update(id, record.clone());
                            let seq =
                                index.get_by_id(id).and_then(|r| r.sequence_number());
                            record.set_sequence_number(seq);
                        } else {
                            let seq = index.append(record.clone())?;
                            record.set_sequence_number(Some(seq));
                        }
                    }

                    if keeps_map {
                        inner.records.insert(id, record.clone());
                    }
                    Ok(record)
                })
                .collect()
        });
        let stored = stored?;

        if self.params.max_record_count.is_some() {
            self.evict_over_capacity();
        }
        if let Some(age) = self.params.max_age_secs {
            self.evict_retired(age);
        }

        self.persist_batch(&stored);
        self.notify(if as_update {
            CacheUpdate::Updated(stored.clone())
        } else {
            CacheUpdate::Added(stored.clone())
        });
        Ok(stored)
    }

    /// Remove one record by id; fires `Removed` with the removed value.
    pub fn remove_by_id(&self, id: Uuid) -> Option<T> {
        self.remove_many(&[id]).pop()
    }

    /// Remove a batch of ids; tombstones tracked slots, always removes from
    /// the primary map. One save, one notification.
    ///
    /// Takes the upgradable slot for the existence check so plain readers
    /// keep running, upgrading to exclusive only when something is present.
    pub fn remove_many(&self, ids: &[Uuid]) -> Vec<T> {
        if ids.is_empty() {
            return Vec::new();
        }

        let removed: Vec<T> = self
            .lock
            .upgradeable_read(
                |inner| {
                    let present: Vec<Uuid> = ids
                        .iter()
                        .copied()
                        .filter(|id| {
                            inner.records.contains_key(id)
                                || inner
                                    .index
                                    .as_ref()
                                    .map_or(false, |index| index.get_by_id(*id).is_some())
                        })
                        .collect();
                    if present.is_empty() {
                        None
                    } else {
                        Some(present)
                    }
                },
                |inner, present| {
                    present
                        .into_iter()
                        .filter_map(|id| {
                            let from_map = inner.records.remove(&id);
                            let from_index =
                                inner.index.as_mut().and_then(|index| index.remove(id));
                            from_map.or(from_index)
                        })
                        .collect()
                },
            )
            .unwrap_or_default();

        if !removed.is_empty() {
            if let Some(engine) = &self.engine {
                engine.note_mutations(removed.len() as u32);
            }
            self.schedule_save(false, false);
            self.notify(CacheUpdate::Removed(removed.clone()));
        }
        removed
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Look up a record by id.
    pub fn get_by_id(&self, id: Uuid) -> Option<T> {
        self.lock.read(|inner| {
            if self.params.mode.keeps_record_map() {
                inner.records.get(&id).cloned()
            } else {
                inner
                    .index
                    .as_ref()
                    .and_then(|index| index.get_by_id(id))
                    .cloned()
            }
        })
    }

    /// First record matching the predicate.
    pub fn get_by_predicate(&self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.lock.read(|inner| {
            if self.params.mode.keeps_record_map() {
                inner.records.values().find(|r| predicate(r)).cloned()
            } else {
                inner
                    .index
                    .as_ref()
                    .and_then(|index| index.iter_live().find(|r| predicate(r)))
                    .cloned()
            }
        })
    }

    /// All records matching the predicate.
    pub fn get_all_by_predicate(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        self.lock.read(|inner| {
            if self.params.mode.keeps_record_map() {
                inner
                    .records
                    .values()
                    .filter(|r| predicate(r))
                    .cloned()
                    .collect()
            } else {
                inner
                    .index
                    .as_ref()
                    .map(|index| index.iter_live().filter(|r| predicate(r)).cloned().collect())
                    .unwrap_or_default()
            }
        })
    }

    /// Live record count.
    pub fn len(&self) -> usize {
        self.lock.read(|inner| {
            if self.params.mode.keeps_record_map() {
                inner.records.len()
            } else {
                inner.index.as_ref().map(|ix| ix.live_len()).unwrap_or(0)
            }
        })
    }

    /// Whether the store holds no live records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records with sequence numbers greater than `seq`, for incremental
    /// consumers. Empty when insertion order is not tracked.
    pub fn items_since(&self, seq: u64) -> Vec<T> {
        self.lock.read(|inner| {
            inner
                .index
                .as_ref()
                .map(|index| index.items_since(seq).cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Last record before `seq` matching the predicate, with its sequence.
    pub fn find_last_before(
        &self,
        seq: u64,
        predicate: impl FnMut(&T) -> bool,
    ) -> Option<(T, u64)> {
        self.lock.read(|inner| {
            inner
                .index
                .as_ref()
                .and_then(|index| index.find_last_before(seq, predicate))
                .map(|(record, s)| (record.clone(), s))
        })
    }

    // ------------------------------------------------------------------
    // Eviction and retention
    // ------------------------------------------------------------------

    /// Remove records whose `created_at` is older than `max_age_secs` ago.
    /// Fires `Expired` once per removed record.
    pub fn evict_retired(&self, max_age_secs: i64) -> Vec<T> {
        let cutoff = Timestamp::now().add_secs(-max_age_secs);
        self.expire_where(|record| record.created_at() < cutoff)
    }

    /// Remove records whose own TTL has elapsed.
    pub fn sweep_expired(&self) -> Vec<T> {
        let now = Timestamp::now();
        self.expire_where(|record| record.is_expired(now))
    }

    /// Scan-then-remove under the upgradable slot: the scan runs alongside
    /// plain readers, the upgrade happens only when something matched.
    fn expire_where(&self, mut predicate: impl FnMut(&T) -> bool) -> Vec<T> {
        let keeps_map = self.params.mode.keeps_record_map();
        let expired: Vec<T> = self
            .lock
            .upgradeable_read(
                |inner| {
                    let ids: Vec<Uuid> = if keeps_map {
                        inner
                            .records
                            .values()
                            .filter(|r| predicate(r))
                            .map(|r| r.id())
                            .collect()
                    } else {
                        inner
                            .index
                            .as_ref()
                            .map(|index| {
                                index
                                    .iter_live()
                                    .filter(|r| predicate(r))
                                    .map(|r| r.id())
                                    .collect()
                            })
                            .unwrap_or_default()
                    };
                    if ids.is_empty() {
                        None
                    } else {
                        Some(ids)
                    }
                },
                |inner, ids| {
                    ids.into_iter()
                        .filter_map(|id| {
                            let from_map = inner.records.remove(&id);
                            let from_index =
                                inner.index.as_mut().and_then(|index| index.remove(id));
                            from_map.or(from_index)
                        })
                        .collect()
                },
            )
            .unwrap_or_default();

        if !expired.is_empty() {
            self.trim_rotated_files();
            if let Some(engine) = &self.engine {
                engine.note_mutations(expired.len() as u32);
            }
            self.schedule_save(false, false);
            self.notify(CacheUpdate::Expired(expired.clone()));
        }
        expired
    }

    /// Remove the oldest `count - max_record_count` records once the bound
    /// is exceeded: oldest by sequence when tracked, else by `created_at`.
    /// Deliberately O(n); bounded caches are small.
    pub fn evict_over_capacity(&self) -> Vec<T> {
        let Some(max) = self.params.max_record_count else {
            return Vec::new();
        };
        let max = max as usize;

        let evicted: Vec<T> = self.lock.write(|inner| {
            let count = if self.params.mode.keeps_record_map() {
                inner.records.len()
            } else {
                inner.index.as_ref().map(|ix| ix.live_len()).unwrap_or(0)
            };
            if count <= max {
                return Vec::new();
            }
            let overflow = count - max;

            let ids: Vec<Uuid> = if let Some(index) = inner.index.as_ref() {
                index.iter_live().take(overflow).map(|r| r.id()).collect()
            } else {
                let mut records: Vec<(Timestamp, Uuid)> = inner
                    .records
                    .values()
                    .map(|r| (r.created_at(), r.id()))
                    .collect();
                records.sort();
                records.into_iter().take(overflow).map(|(_, id)| id).collect()
            };

            ids.into_iter()
                .filter_map(|id| {
                    let from_map = inner.records.remove(&id);
                    let from_index = inner.index.as_mut().and_then(|index| index.remove(id));
                    from_map.or(from_index)
                })
                .collect()
        });

        if !evicted.is_empty() {
            self.trim_rotated_files();
            if let Some(engine) = &self.engine {
                engine.note_mutations(evicted.len() as u32);
            }
            self.schedule_save(false, false);
            self.notify(CacheUpdate::Removed(evicted.clone()));
        }
        evicted
    }

    /// Enable insertion-order tracking. One-time: returns false when the
    /// cache already holds records, so numbering is contiguous from the
    /// first insert.
    pub fn track_insertion_order(&self) -> bool {
        self.lock.write(|inner| {
            if !inner.records.is_empty() {
                return false;
            }
            match &inner.index {
                Some(index) => index.is_empty(),
                None => {
                    inner.index = Some(SequenceIndex::new());
                    true
                }
            }
        })
    }

    /// Drop every record; fires `Cleared` and persists the empty state.
    pub fn clear(&self) {
        self.clear_internal(true);
    }

    fn clear_internal(&self, save: bool) {
        self.lock.write(|inner| {
            inner.records.clear();
            if let Some(index) = inner.index.as_mut() {
                index.clear();
            }
        });
        self.notify(CacheUpdate::Cleared);
        if save {
            self.schedule_save(true, true);
        }
    }

    // ------------------------------------------------------------------
    // Persistence orchestration
    // ------------------------------------------------------------------

    /// Register the baseline callback seeding new rotated append files.
    pub fn set_baseline(&self, baseline: BaselineFn<T>) {
        if let Some(engine) = &self.engine {
            engine.set_baseline(baseline);
        }
    }

    /// Delete every on-disk file for this store (used by `Reset`).
    pub fn delete_files(&self) -> Result<()> {
        match &self.engine {
            Some(engine) => engine.delete_files(),
            None => Ok(()),
        }
    }

    /// Request a save. `sync` blocks until durable; otherwise the request
    /// coalesces into the pending-save counter that the sweeper flushes
    /// when the cadence elapses. `force` bypasses rate limiting.
    pub fn schedule_save(&self, sync: bool, force: bool) {
        if self.engine.is_none() || !self.params.mode.keeps_record_map() {
            return;
        }
        self.pending_saves.fetch_add(1, Ordering::Relaxed);
        if force {
            self.force_pending.store(true, Ordering::Relaxed);
        }
        if sync {
            self.flush_save(force);
        }
    }

    /// Flush the pending save if due. Called by the sweeper every tick and
    /// by synchronous save requests.
    pub fn flush_save(&self, force: bool) {
        let Some(engine) = &self.engine else {
            return;
        };
        if !self.params.mode.keeps_record_map() {
            return;
        }
        let force = force || self.force_pending.swap(false, Ordering::Relaxed);
        if !force {
            if self.pending_saves.load(Ordering::Relaxed) == 0 {
                return;
            }
            if !engine.save_due() {
                return;
            }
        }

        // Count the requests this snapshot covers; later requests stay
        // pending for the next flush
        let observed = self.pending_saves.load(Ordering::Relaxed);
        let lock_busy = self.lock.is_exclusively_held();
        let payload = self.snapshot_payload();

        match engine.save(&payload, force, lock_busy) {
            Ok(true) => {
                let _ = self
                    .pending_saves
                    .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                        Some(v.saturating_sub(observed))
                    });
            }
            Ok(false) => {}
            Err(Error::OutOfMemory(msg)) => {
                error!(store = %self.store_id, %msg, "save ran out of memory");
                if self.params.flush_on_out_of_memory {
                    warn!(store = %self.store_id, "flushing cache after out-of-memory save");
                    self.clear_internal(false);
                }
            }
            Err(e) => {
                warn!(
                    store = %self.store_id,
                    error = %e,
                    "save failed; in-memory state remains authoritative"
                );
            }
        }
    }

    fn persist_batch(&self, stored: &[T]) {
        let Some(engine) = &self.engine else {
            return;
        };

        if !self.params.mode.keeps_record_map() {
            match engine.append(stored) {
                Ok(Some(first_retained)) => {
                    self.lock.write(|inner| {
                        if let Some(index) = inner.index.as_mut() {
                            index.trim_up_to(first_retained.saturating_sub(1));
                        }
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        store = %self.store_id,
                        error = %e,
                        "append failed; in-memory state remains authoritative"
                    );
                }
            }
            return;
        }

        engine.note_mutations(stored.len() as u32);
        self.schedule_save(false, false);
    }

    fn trim_rotated_files(&self) {
        if self.params.mode.keeps_record_map() {
            return;
        }
        let Some(engine) = &self.engine else {
            return;
        };
        let offset = self.lock.read(|inner| {
            inner.index.as_ref().map(|index| index.offset()).unwrap_or(0)
        });
        engine.apply_trim(offset);
    }

    fn snapshot_payload(&self) -> CachePayload<T> {
        self.lock.read(|inner| {
            if let Some(index) = inner.index.as_ref() {
                CachePayload::Sequenced {
                    offset: index.offset(),
                    records: index.slots(),
                }
            } else {
                let mut records: Vec<T> = inner.records.values().cloned().collect();
                records.sort_by_key(|r| (r.created_at(), r.id()));
                CachePayload::Bare(records)
            }
        })
    }

    // ------------------------------------------------------------------
    // Notifications and background sweep
    // ------------------------------------------------------------------

    /// Register an update listener.
    pub fn add_listener(&self, listener: UpdateListener<T>) {
        self.listeners.lock().push(listener);
    }

    fn notify(&self, update: CacheUpdate<T>) {
        if !self.params.update_notifications || update.is_empty() {
            return;
        }
        let listeners = self.listeners.lock();
        for listener in listeners.iter() {
            listener(&update);
        }
    }

    /// One sweep pass: per-record TTL, store-level retention, due saves.
    pub fn sweep(&self) {
        self.sweep_expired();
        if let Some(age) = self.params.max_age_secs {
            self.evict_retired(age);
        }
        self.flush_save(false);
    }

    /// Start the background sweep thread for this cache.
    pub fn start_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let sweeper = Sweeper::start(
            format!("sweep:{}", self.store_id),
            self.params.sweep_interval,
            move || {
                if let Some(cache) = weak.upgrade() {
                    cache.sweep();
                }
            },
        );
        *self.sweeper.lock() = Some(sweeper);
    }

    /// Stop the background sweep thread.
    pub fn stop_sweeper(&self) {
        if let Some(mut sweeper) = self.sweeper.lock().take() {
            sweeper.stop();
        }
    }
}

impl<T: Record, C: RecordCodec<T>> Drop for MirrorCache<T, C> {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}
