//! Insertion-order sequence index with tombstoned slots
//!
//! Assigns contiguous, strictly increasing sequence numbers to records in
//! insertion order and answers "what changed after sequence N" queries for
//! incremental consumers. Logical deletes keep their slot as a tombstone so
//! numbering stays contiguous; a run of tombstones at the front is pruned by
//! advancing the rolling offset.
//!
//! Sequence numbers are 1-based: the slot at position `i` holds
//! `offset + i + 1`, and `items_since(0)` means "from the beginning".

use mirror_core::{Error, Record, Result};
use std::collections::VecDeque;
use uuid::Uuid;

/// Ordered index of live and tombstoned records with a rolling offset.
#[derive(Debug, Clone)]
pub struct SequenceIndex<T> {
    entries: VecDeque<Option<T>>,
    offset: u64,
}

impl<T: Record> SequenceIndex<T> {
    /// Create an empty index with offset 0.
    pub fn new() -> Self {
        SequenceIndex {
            entries: VecDeque::new(),
            offset: 0,
        }
    }

    /// Rebuild an index from persisted parts.
    ///
    /// Slot sequence numbers are reassigned from the offset to restore the
    /// contiguity invariant regardless of what the file claimed.
    pub fn from_parts(offset: u64, entries: Vec<Option<T>>) -> Self {
        let mut index = SequenceIndex {
            entries: VecDeque::from(entries),
            offset,
        };
        for (i, slot) in index.entries.iter_mut().enumerate() {
            if let Some(record) = slot {
                record.set_sequence_number(Some(offset + i as u64 + 1));
            }
        }
        index
    }

    /// The rolling offset: number of slots trimmed from the front so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Total slots, live and tombstoned.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the index holds no slots at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live (non-tombstoned) record count.
    pub fn live_len(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    /// The sequence number the next append will receive.
    pub fn next_sequence(&self) -> u64 {
        self.offset + self.entries.len() as u64 + 1
    }

    /// Append a record, assigning it the next sequence number.
    ///
    /// Fails with [`Error::SequenceOverflow`] once `offset + len + 1` would
    /// exceed `u64::MAX`; callers must not run past `u64::MAX - offset`
    /// records. Wraparound is deliberately unsupported.
    pub fn append(&mut self, mut record: T) -> Result<u64> {
        let seq = self
            .offset
            .checked_add(self.entries.len() as u64)
            .and_then(|n| n.checked_add(1))
            .ok_or(Error::SequenceOverflow)?;
        record.set_sequence_number(Some(seq));
        self.entries.push_back(Some(record));
        Ok(seq)
    }

    /// Tombstone the slot holding `id`, then prune the leading tombstone run.
    ///
    /// Returns the removed record, or `None` if no live slot matches.
    pub fn remove(&mut self, id: Uuid) -> Option<T> {
        let pos = self.position_of(id)?;
        let removed = self.entries[pos].take();

        while matches!(self.entries.front(), Some(None)) {
            self.entries.pop_front();
            self.offset += 1;
        }

        removed
    }

    /// Replace the record in the slot holding `id`, preserving its sequence
    /// number. Returns false if no live slot matches.
    pub fn update(&mut self, id: Uuid, mut record: T) -> bool {
        let Some(pos) = self.position_of(id) else {
            return false;
        };
        let seq = self.offset + pos as u64 + 1;
        record.set_sequence_number(Some(seq));
        self.entries[pos] = Some(record);
        true
    }

    /// Live records with sequence numbers greater than `seq`, in order.
    ///
    /// `seq == 0` or `seq < offset` means "from the beginning". The returned
    /// iterator is finite and borrows the index; call again to restart.
    pub fn items_since(&self, seq: u64) -> impl Iterator<Item = &T> + '_ {
        let start = usize::try_from(seq.saturating_sub(self.offset)).unwrap_or(usize::MAX);
        self.entries
            .iter()
            .skip(start)
            .filter_map(|slot| slot.as_ref())
    }

    /// Scan backward from just below `seq` for the last record matching
    /// `predicate`. Returns the record and its sequence number.
    pub fn find_last_before(
        &self,
        seq: u64,
        mut predicate: impl FnMut(&T) -> bool,
    ) -> Option<(&T, u64)> {
        let end = usize::try_from(seq.saturating_sub(self.offset).saturating_sub(1))
            .unwrap_or(usize::MAX)
            .min(self.entries.len());

        for i in (0..end).rev() {
            if let Some(record) = self.entries[i].as_ref() {
                if predicate(record) {
                    return Some((record, self.offset + i as u64 + 1));
                }
            }
        }
        None
    }

    /// Bulk-remove every slot with sequence number `<= seq`, advancing the
    /// offset by the count removed. Used by retention policies and rotated
    /// file deletion.
    pub fn trim_up_to(&mut self, seq: u64) -> usize {
        let count = usize::try_from(seq.saturating_sub(self.offset))
            .unwrap_or(usize::MAX)
            .min(self.entries.len());
        self.entries.drain(..count);
        self.offset += count as u64;
        count
    }

    /// Live records in sequence order.
    pub fn iter_live(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries.iter().filter_map(|slot| slot.as_ref())
    }

    /// Find a live record by id.
    pub fn get_by_id(&self, id: Uuid) -> Option<&T> {
        self.iter_live().find(|record| record.id() == id)
    }

    /// Clone the slots for persistence.
    pub fn slots(&self) -> Vec<Option<T>> {
        self.entries.iter().cloned().collect()
    }

    /// Drop all slots and restart numbering from zero.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.offset = 0;
    }

    fn position_of(&self, id: Uuid) -> Option<usize> {
        self.entries.iter().position(|slot| {
            slot.as_ref()
                .map(|record| record.id() == id)
                .unwrap_or(false)
        })
    }
}

impl<T: Record> Default for SequenceIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}
