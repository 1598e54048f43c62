//! Storage layer for the mirror store
//!
//! This crate implements one store's record cache and its durability:
//! - MirrorCache: concurrent record map + eviction + notifications
//! - SequenceIndex: insertion-order numbering with tombstones
//! - PersistenceEngine: cache files, safe-save generations, append rotation,
//!   corruption quarantine
//! - CachePaths: the on-disk layout under the cache root
//! - Cipher: the encryption seam for encrypted stores
//! - Sweeper: the background TTL/retention/save thread
//! - shutdown: process-wide in-flight write tracking for orderly exit

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod cipher;
pub mod paths;
pub mod persist;
pub mod sequence;
pub mod shutdown;
pub mod sweeper;

pub use cache::{CacheUpdate, MirrorCache, UpdateListener};
pub use cipher::{Cipher, PassthroughCipher};
pub use paths::CachePaths;
pub use persist::{BaselineFn, CachePayload, PersistenceEngine, RotatedFile};
pub use sequence::SequenceIndex;
pub use shutdown::{begin_write, in_flight_writes, wait_for_writes, WriteGuard};
pub use sweeper::Sweeper;
