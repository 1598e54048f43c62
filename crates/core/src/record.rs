//! Record contract and codec seam
//!
//! A record is any typed payload the store can hold. The store never inspects
//! payload fields directly; everything it needs is exposed through the
//! [`Record`] trait, and everything that crosses a persistence or remote
//! boundary goes through a [`RecordCodec`].
//!
//! The codec is a static, per-type seam. [`JsonCodec`] is the provided
//! implementation for any `Serialize + DeserializeOwned` record type; stores
//! with bespoke wire shapes implement the trait directly.

use crate::error::Result;
use crate::timestamp::Timestamp;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use uuid::Uuid;

/// Contract every stored record type implements.
///
/// Identity is by `id`; two records with the same id are the same record.
/// `expires_after_secs` of 0 means the record never expires on its own
/// (store-level retention may still remove it).
pub trait Record: Clone + Send + Sync + 'static {
    /// Unique record id
    fn id(&self) -> Uuid;

    /// Replace the record id (used when inserting records with a nil id)
    fn set_id(&mut self, id: Uuid);

    /// Creation time, assigned by the producer
    fn created_at(&self) -> Timestamp;

    /// Per-record TTL in seconds; 0 = never expires
    fn expires_after_secs(&self) -> i64;

    /// Insertion-order sequence number, when the store tracks one
    fn sequence_number(&self) -> Option<u64>;

    /// Set or clear the sequence number
    fn set_sequence_number(&mut self, seq: Option<u64>);

    /// Whether this record's own TTL has elapsed at `now`
    fn is_expired(&self, now: Timestamp) -> bool {
        let ttl = self.expires_after_secs();
        ttl > 0 && self.created_at().add_secs(ttl) <= now
    }
}

/// Static record codec.
///
/// All record payloads passing through the persistence layer or a remote
/// store go through the codec. Implementations must be `Send + Sync` to
/// allow concurrent encoding from multiple threads.
pub trait RecordCodec<T>: Send + Sync + 'static {
    /// Encode a record to its JSON wire form.
    fn encode(&self, record: &T) -> Result<serde_json::Value>;

    /// Decode a record from its JSON wire form.
    fn decode(&self, value: serde_json::Value) -> Result<T>;

    /// Stable schema description for this record type.
    ///
    /// Store ids are derived by fingerprinting this string, so it must not
    /// change between runs for the same logical schema.
    fn schema(&self) -> String;
}

/// Serde-backed codec for any `Serialize + DeserializeOwned` record type.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    /// Create a codec instance
    pub fn new() -> Self {
        JsonCodec {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RecordCodec<T> for JsonCodec<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, record: &T) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(record)?)
    }

    fn decode(&self, value: serde_json::Value) -> Result<T> {
        Ok(serde_json::from_value(value)?)
    }

    fn schema(&self) -> String {
        std::any::type_name::<T>().to_string()
    }
}
