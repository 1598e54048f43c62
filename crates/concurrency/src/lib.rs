//! Concurrency primitives for the mirror store
//!
//! One export: [`UpgradeLock`], the reader/writer lock wrapper every store
//! component uses to guard its record map and sequence index. Acquisitions
//! are timed, logged when blocked, and retried until they succeed.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod upgrade_lock;

pub use upgrade_lock::{UpgradeLock, DEFAULT_LOCK_TIMEOUT};
