//! Storage mirror engine
//!
//! The facade layer over the storage crate: per-store lifecycle and routing
//! ([`StorageMirror`]), the multi-key [`StoreRegistry`], the [`RemoteStore`]
//! capability consumed for remote-backed stores, timed request/response
//! correlation, the query filter mini-language, and local query evaluation.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod filter;
pub mod mirror;
pub mod query;
pub mod registry;
pub mod remote;
pub mod response;
pub mod timed;

pub use filter::RecordFilter;
pub use mirror::{MirrorConfig, RecordQuery, StorageMirror, StoreState};
pub use query::{evaluate, QueryOptions, RecordOrder};
pub use registry::{AnyStore, StoreRegistry};
pub use remote::{RemoteCommand, RemotePayload, RemoteQuery, RemoteStore};
pub use response::{RecordResponse, ResponseCallback, ResponseError, ResponseErrorKind};
pub use timed::{TimedRequest, TimedRequests};
