//! Core types and traits for the mirror store
//!
//! This crate defines the foundational types used throughout the system:
//! - Record: the contract every stored record type implements
//! - RecordCodec / JsonCodec: the static record⇄JSON codec seam
//! - Timestamp: microsecond-precision timestamps
//! - StoreId / StoreMode / SaveCadence / StoreParams: store identity and policy
//! - Error: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod record;
pub mod store;
pub mod timestamp;

pub use error::{Error, Result};
pub use record::{JsonCodec, Record, RecordCodec};
pub use store::{SaveCadence, StoreId, StoreMode, StoreParams};
pub use timestamp::Timestamp;
