//! Mirrorstore - persistent record cache and storage mirror
//!
//! Mirrorstore is the record-cache and storage-mirroring layer of a
//! distributed device runtime: each node keeps typed record collections that
//! survive restarts, tolerate partial write failures, stay fast in memory,
//! and optionally mirror a remote storage service.
//!
//! # Quick Start
//!
//! ```ignore
//! use mirrorstore::{JsonCodec, MirrorConfig, StorageMirror, StoreRegistry};
//!
//! let registry = StoreRegistry::new();
//! let mirror = StorageMirror::new(Arc::new(JsonCodec::<Reading>::new()), MirrorConfig::default());
//!
//! mirror.initialize(&registry)?;
//! mirror.add_items(vec![reading], None, None);
//! ```
//!
//! # Architecture
//!
//! Stores are fronted by a [`StorageMirror`] facade that routes to the
//! in-memory mirror cache (local modes) or a remote store (remote-backed
//! mode). Internal layers (storage, concurrency, persistence) are re-exported
//! for embedders that need them.

pub use mirror_core::{
    Error, JsonCodec, Record, RecordCodec, Result, SaveCadence, StoreId, StoreMode, StoreParams,
    Timestamp,
};
pub use mirror_engine::{
    AnyStore, MirrorConfig, QueryOptions, RecordFilter, RecordOrder, RecordQuery, RecordResponse,
    RemoteCommand, RemotePayload, RemoteQuery, RemoteStore, ResponseCallback, ResponseError,
    ResponseErrorKind, StorageMirror, StoreRegistry, StoreState, TimedRequests,
};
pub use mirror_storage::{
    wait_for_writes, CacheUpdate, Cipher, MirrorCache, PassthroughCipher, SequenceIndex,
    UpdateListener,
};
