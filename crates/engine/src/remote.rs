//! Remote store capability
//!
//! The message-bus transport to a remote storage service is consumed here as
//! an abstract capability: every call carries an opaque correlation id, and
//! the transport later delivers an opaque response payload back through
//! `StorageMirror::handle_remote_response` with the same id.

use mirror_core::Result;
use std::collections::HashMap;
use uuid::Uuid;

/// Mutation command for `data_store`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    /// Insert; fails or is ignored for existing keys (remote policy)
    Insert,
    /// Insert new keys, update existing ones
    InsertOrUpdate,
}

/// Query shape forwarded verbatim to a remote store.
///
/// `order` and `grouping` are opaque hints the local path never interprets.
#[derive(Debug, Clone, Default)]
pub struct RemoteQuery {
    /// Column projection hint
    pub column_filter: Option<String>,
    /// Filter expression in the store's mini-language
    pub filter: Option<String>,
    /// Ordering hint
    pub order: Option<String>,
    /// Grouping hint
    pub grouping: Option<String>,
    /// Result cap
    pub top: Option<usize>,
    /// Page index
    pub page: Option<usize>,
    /// Answer from the remote's local replica only
    pub local_only: bool,
}

/// Response payload delivered by the transport.
#[derive(Debug, Clone, Default)]
pub struct RemotePayload {
    /// Encoded records, decoded by the store's codec on arrival
    pub records: Vec<serde_json::Value>,
    /// Error reported by the remote store
    pub error: Option<String>,
}

/// The remote storage service, as consumed by the mirror.
///
/// Implementations enqueue the call onto the transport and return; results
/// arrive asynchronously, correlated by id. Errors returned here mean the
/// call could not even be enqueued.
pub trait RemoteStore: Send + Sync {
    /// Execute a SQL statement against the remote store.
    fn execute_sql(
        &self,
        sql: &str,
        column_filter: Option<&str>,
        correlation_id: Uuid,
        table_name: Option<&str>,
    ) -> Result<()>;

    /// Create (or reset) a store on the remote service.
    ///
    /// `defaults` is an encoded record set the remote seeds a fresh store
    /// with; opaque to the mirror.
    #[allow(clippy::too_many_arguments)]
    fn create_store(
        &self,
        schema: &str,
        defaults: Option<serde_json::Value>,
        store_name: &str,
        description: &str,
        reset: bool,
        correlation_id: Uuid,
        table_name: Option<&str>,
    ) -> Result<()>;

    /// Insert or update a batch of encoded records keyed by record id.
    fn data_store(
        &self,
        records_by_key: HashMap<String, serde_json::Value>,
        command: RemoteCommand,
        correlation_id: Uuid,
        table_name: Option<&str>,
    ) -> Result<()>;

    /// Request records matching a query.
    fn request_records(&self, store_id: &str, query: &RemoteQuery, correlation_id: Uuid)
        -> Result<()>;

    /// Subscribe to (or unsubscribe from) change push notifications.
    fn set_subscription(&self, store_id: &str, enabled: bool) -> Result<()>;
}
