//! The storage mirror facade
//!
//! One `StorageMirror` fronts one store: it owns the store's lifecycle state
//! machine, routes queries and mutations to the local [`MirrorCache`] or the
//! remote store depending on mode, correlates remote calls through
//! [`TimedRequests`], and registers the store in the [`StoreRegistry`] under
//! all of its lookup keys.
//!
//! ## Lifecycle
//!
//! `Uninitialized → Initializing → Ready`. `Ready` is set exactly once per
//! initialization cycle and gates every query/mutation API; `reset` returns
//! the store to `Uninitialized` (still registered), `remove_store` flushes
//! and unregisters. Calls made before `Ready` resolve with an explicit
//! not-ready flagged response, never an exception.

use crate::filter::RecordFilter;
use crate::query::{self, QueryOptions, RecordOrder};
use crate::registry::{AnyStore, StoreRegistry};
use crate::remote::{RemoteCommand, RemotePayload, RemoteQuery, RemoteStore};
use crate::response::{RecordResponse, ResponseCallback, ResponseErrorKind};
use crate::timed::TimedRequests;
use mirror_core::{
    Error, Record, RecordCodec, Result, StoreId, StoreMode, StoreParams, Timestamp,
};
use mirror_storage::{Cipher, MirrorCache, UpdateListener};
use parking_lot::{Condvar, Mutex};
use std::any::Any;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// How often the timeout scanner visits outstanding remote requests.
const REQUEST_TIMER_INTERVAL: Duration = Duration::from_millis(250);

/// Store lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Not yet initialized (or reset)
    Uninitialized,
    /// Initialization in flight
    Initializing,
    /// Accepting queries and mutations
    Ready,
}

/// Everything a mirror needs besides its codec.
#[derive(Default)]
pub struct MirrorConfig {
    /// Store policy
    pub params: StoreParams,
    /// Cache directory for persistent stores
    pub cache_root: Option<PathBuf>,
    /// Cipher for encrypted stores
    pub cipher: Option<Arc<dyn Cipher>>,
    /// Remote store capability for remote-backed stores
    pub remote: Option<Arc<dyn RemoteStore>>,
}

/// One query against a store.
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// Filter expression in the mini-language; `None` matches everything
    pub filter: Option<String>,
    /// Column projection hint, forwarded to remote stores only
    pub column_filter: Option<String>,
    /// Result cap (stride-decimated when below the match count)
    pub top: Option<usize>,
    /// Zero-based page index
    pub page: Option<usize>,
    /// Result order
    pub order: RecordOrder,
    /// Forwarded to the remote store: answer from its local replica
    pub local_only: bool,
    /// Correlation cookie passed back in the response
    pub cookie: Option<u64>,
}

/// Facade over one store.
pub struct StorageMirror<T: Record, C: RecordCodec<T>> {
    mirror_id: Uuid,
    store_id: StoreId,
    config: MirrorConfig,
    codec: Arc<C>,
    state: Mutex<StoreState>,
    ready_cv: Condvar,
    cache: Mutex<Option<Arc<MirrorCache<T, C>>>>,
    requests: Arc<TimedRequests<T>>,
    subscription_enabled: AtomicBool,
}

impl<T, C> StorageMirror<T, C>
where
    T: Record,
    C: RecordCodec<T>,
{
    /// Create a mirror for the codec's record type.
    ///
    /// The store id is derived from the codec's schema, suffixed with the
    /// configured table name.
    pub fn new(codec: Arc<C>, config: MirrorConfig) -> Arc<Self> {
        let store_id = StoreId::derive(&codec.schema(), config.params.table_name.as_deref());
        Arc::new(StorageMirror {
            mirror_id: Uuid::new_v4(),
            store_id,
            config,
            codec,
            state: Mutex::new(StoreState::Uninitialized),
            ready_cv: Condvar::new(),
            cache: Mutex::new(None),
            requests: Arc::new(TimedRequests::new()),
            subscription_enabled: AtomicBool::new(false),
        })
    }

    /// The store's derived id.
    pub fn store_id(&self) -> &StoreId {
        &self.store_id
    }

    /// The internal mirror id (also a registry key).
    pub fn mirror_id(&self) -> Uuid {
        self.mirror_id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> StoreState {
        *self.state.lock()
    }

    /// Whether the store accepts queries and mutations.
    pub fn is_ready(&self) -> bool {
        self.state() == StoreState::Ready
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Initialize the store: build and load the local cache (local modes) or
    /// issue the remote create call (remote-backed). Idempotent; a second
    /// call while initializing or ready is a no-op.
    pub fn initialize(self: &Arc<Self>, registry: &StoreRegistry) -> Result<()> {
        self.start_initialization(registry, Vec::new(), false)
    }

    /// Initialize and seed an empty store with default records. Idempotent.
    pub fn create(
        self: &Arc<Self>,
        registry: &StoreRegistry,
        defaults: Vec<T>,
        reset: bool,
    ) -> Result<()> {
        self.start_initialization(registry, defaults, reset)
    }

    fn start_initialization(
        self: &Arc<Self>,
        registry: &StoreRegistry,
        defaults: Vec<T>,
        reset: bool,
    ) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                StoreState::Ready | StoreState::Initializing => return Ok(()),
                StoreState::Uninitialized => *state = StoreState::Initializing,
            }
        }
        self.register_keys(registry);

        let result = if self.is_remote() {
            self.start_remote_initialization(defaults, reset)
        } else {
            self.start_local_initialization(defaults, reset)
        };
        if result.is_err() {
            // Leave the cycle restartable instead of wedged in Initializing
            let mut state = self.state.lock();
            if *state == StoreState::Initializing {
                *state = StoreState::Uninitialized;
            }
        }
        result
    }

    fn start_local_initialization(&self, defaults: Vec<T>, reset: bool) -> Result<()> {
        let cache = Arc::new(MirrorCache::new(
            self.store_id.clone(),
            self.config.params.clone(),
            Arc::clone(&self.codec),
            self.config.cache_root.as_deref(),
            self.config.cipher.clone(),
        )?);

        if reset {
            cache.delete_files()?;
        }
        let loaded = cache.load();
        cache.start_sweeper();

        let seeded = if loaded == 0 && !defaults.is_empty() {
            cache.add_many(defaults)?.len()
        } else {
            0
        };

        *self.cache.lock() = Some(cache);
        info!(store = %self.store_id, loaded, seeded, "store initialized");
        self.complete_initialization();
        Ok(())
    }

    fn start_remote_initialization(self: &Arc<Self>, defaults: Vec<T>, reset: bool) -> Result<()> {
        let remote = self.remote()?;
        self.requests.start_timer(REQUEST_TIMER_INTERVAL);

        let weak = Arc::downgrade(self);
        let correlation = self.requests.register(
            self.config.params.remote_timeout,
            None,
            None,
            Box::new(move |response: RecordResponse<T>| {
                if let Some(mirror) = weak.upgrade() {
                    if response.is_success() {
                        mirror.complete_initialization();
                    } else {
                        mirror.fail_initialization(&response);
                    }
                }
            }),
        );

        let encoded_defaults = if defaults.is_empty() {
            None
        } else {
            let values: Result<Vec<_>> = defaults.iter().map(|r| self.codec.encode(r)).collect();
            Some(serde_json::Value::Array(values?))
        };

        remote.create_store(
            &self.codec.schema(),
            encoded_defaults,
            self.store_id.as_str(),
            "",
            reset,
            correlation,
            self.config.params.table_name.as_deref(),
        )
    }

    fn complete_initialization(&self) {
        let mut state = self.state.lock();
        if *state == StoreState::Initializing {
            *state = StoreState::Ready;
            self.ready_cv.notify_all();
            info!(store = %self.store_id, "store ready");
        }
    }

    fn fail_initialization(&self, response: &RecordResponse<T>) {
        let mut state = self.state.lock();
        if *state == StoreState::Initializing {
            *state = StoreState::Uninitialized;
            let message = response
                .error
                .as_ref()
                .map(|e| e.message.clone())
                .unwrap_or_default();
            warn!(store = %self.store_id, %message, "store initialization failed");
        }
    }

    /// Block until the store is ready or the timeout elapses.
    pub fn wait_for_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != StoreState::Ready {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            self.ready_cv.wait_for(&mut state, deadline - now);
        }
        true
    }

    /// Clear the store's content and delete its files; the store returns to
    /// `Uninitialized` but stays registered.
    pub fn reset(&self) -> Result<()> {
        *self.state.lock() = StoreState::Uninitialized;

        let cache = self.cache.lock().take();
        if let Some(cache) = cache {
            cache.stop_sweeper();
            cache.delete_files()?;
        }
        info!(store = %self.store_id, "store reset");
        Ok(())
    }

    /// Flush the store and remove it from the registry.
    pub fn remove_store(&self, registry: &StoreRegistry) -> Result<()> {
        let cache = self.cache.lock().take();
        if let Some(cache) = cache {
            cache.schedule_save(true, true);
            cache.stop_sweeper();
        }
        registry.unregister(self.store_id.as_str());
        *self.state.lock() = StoreState::Uninitialized;
        info!(store = %self.store_id, "store removed");
        Ok(())
    }

    fn register_keys(self: &Arc<Self>, registry: &StoreRegistry) {
        let mut keys = vec![
            self.store_id.as_str().to_string(),
            StoreId::derive(&self.codec.schema(), None).as_str().to_string(),
            self.mirror_id.to_string(),
        ];
        if let Some(table) = &self.config.params.table_name {
            keys.push(table.clone());
        }
        keys.sort();
        keys.dedup();
        registry.register(keys, Arc::clone(self) as Arc<dyn AnyStore>);
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Evaluate a query. Local modes compile the filter and scan under a
    /// read lock; remote-backed stores issue a correlated remote request.
    /// The callback is invoked exactly once.
    pub fn get_records(&self, query: RecordQuery, callback: ResponseCallback<T>) {
        if !self.is_ready() {
            callback(self.not_ready_response(query.cookie));
            return;
        }

        if self.is_remote() {
            self.remote_get_records(query, callback);
            return;
        }

        let Some(cache) = self.cache_handle() else {
            callback(self.not_ready_response(query.cookie));
            return;
        };

        let filter = match query.filter.as_deref() {
            Some(expr) => match RecordFilter::compile(expr) {
                Ok(filter) => filter,
                Err(e) => {
                    callback(RecordResponse::failure(
                        ResponseErrorKind::FilterCompile,
                        e.to_string(),
                        Vec::new(),
                        query.cookie,
                    ));
                    return;
                }
            },
            None => RecordFilter::default(),
        };

        let now = Timestamp::now();
        let mut serialization_errors = Vec::new();
        let matched = if filter.is_empty() {
            cache.get_all_by_predicate(|_| true)
        } else {
            let codec = &self.codec;
            cache.get_all_by_predicate(|record| match codec.encode(record) {
                Ok(encoded) => filter.matches(record.created_at(), &encoded, now),
                Err(e) => {
                    serialization_errors.push(e.to_string());
                    false
                }
            })
        };

        if matched.is_empty() {
            callback(
                RecordResponse::failure(
                    ResponseErrorKind::NoMatch,
                    "no records match filter",
                    Vec::new(),
                    query.cookie,
                )
                .with_serialization_errors(serialization_errors),
            );
            return;
        }

        let options = QueryOptions {
            top: query.top,
            page: query.page,
            order: query.order,
        };
        let records = query::evaluate(matched, &options);
        callback(
            RecordResponse::success(records, query.cookie)
                .with_serialization_errors(serialization_errors),
        );
    }

    fn remote_get_records(&self, query: RecordQuery, callback: ResponseCallback<T>) {
        let remote = match self.remote() {
            Ok(remote) => remote,
            Err(e) => {
                callback(RecordResponse::failure(
                    ResponseErrorKind::Internal,
                    e.to_string(),
                    Vec::new(),
                    query.cookie,
                ));
                return;
            }
        };

        let remote_query = RemoteQuery {
            column_filter: query.column_filter.clone(),
            filter: query.filter.clone(),
            order: match &query.order {
                RecordOrder::Passthrough(hint) => Some(hint.clone()),
                RecordOrder::CreatedAscending => Some("created_at".to_string()),
                RecordOrder::CreatedDescending => Some("created_at desc".to_string()),
                RecordOrder::Default => None,
            },
            grouping: None,
            top: query.top,
            page: query.page,
            local_only: query.local_only,
        };

        let correlation =
            self.requests
                .register(self.config.params.remote_timeout, query.cookie, None, callback);
        if let Err(e) = remote.request_records(self.store_id.as_str(), &remote_query, correlation) {
            self.resolve_failed_dispatch(correlation, e);
        }
    }

    // ------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------

    /// Insert a batch of records.
    pub fn add_items(
        &self,
        records: Vec<T>,
        cookie: Option<u64>,
        callback: Option<ResponseCallback<T>>,
    ) {
        self.mutate_items(records, RemoteCommand::Insert, false, cookie, callback);
    }

    /// Insert-or-update a batch of records.
    pub fn update_items(
        &self,
        records: Vec<T>,
        cookie: Option<u64>,
        callback: Option<ResponseCallback<T>>,
    ) {
        self.mutate_items(records, RemoteCommand::InsertOrUpdate, true, cookie, callback);
    }

    fn mutate_items(
        &self,
        records: Vec<T>,
        command: RemoteCommand,
        as_update: bool,
        cookie: Option<u64>,
        callback: Option<ResponseCallback<T>>,
    ) {
        if !self.is_ready() {
            Self::resolve(callback, self.not_ready_response(cookie));
            return;
        }

        if self.is_remote() {
            self.remote_mutate(records, command, cookie, callback);
            return;
        }

        let Some(cache) = self.cache_handle() else {
            Self::resolve(callback, self.not_ready_response(cookie));
            return;
        };

        let result = if as_update {
            cache.update_many(records)
        } else {
            cache.add_many(records)
        };

        match result {
            Ok(stored) => Self::resolve(callback, RecordResponse::success(stored, cookie)),
            Err(e) => Self::resolve(
                callback,
                RecordResponse::failure(
                    ResponseErrorKind::from_error(&e),
                    e.to_string(),
                    Vec::new(),
                    cookie,
                ),
            ),
        }
    }

    fn remote_mutate(
        &self,
        records: Vec<T>,
        command: RemoteCommand,
        cookie: Option<u64>,
        callback: Option<ResponseCallback<T>>,
    ) {
        let remote = match self.remote() {
            Ok(remote) => remote,
            Err(e) => {
                Self::resolve(
                    callback,
                    RecordResponse::failure(
                        ResponseErrorKind::Internal,
                        e.to_string(),
                        Vec::new(),
                        cookie,
                    ),
                );
                return;
            }
        };

        // Per-record encode failures are collected, not fatal to the batch
        let mut serialization_errors = Vec::new();
        let mut by_key = HashMap::new();
        let mut pending = HashMap::new();
        for record in records {
            match self.codec.encode(&record) {
                Ok(value) => {
                    by_key.insert(record.id().to_string(), value);
                    pending.insert(record.id().to_string(), record);
                }
                Err(e) => serialization_errors.push(e.to_string()),
            }
        }
        if !serialization_errors.is_empty() {
            warn!(
                store = %self.store_id,
                failed = serialization_errors.len(),
                "records dropped from remote batch after encode failures"
            );
        }

        let callback = callback.unwrap_or_else(|| Box::new(|_| {}));
        // Encode failures ride along on whichever completion wins
        let callback: ResponseCallback<T> = if serialization_errors.is_empty() {
            callback
        } else {
            Box::new(move |mut response: RecordResponse<T>| {
                response.serialization_errors.extend(serialization_errors);
                callback(response);
            })
        };
        let correlation = self.requests.register(
            self.config.params.remote_timeout,
            cookie,
            Some(pending),
            callback,
        );

        if let Err(e) = remote.data_store(
            by_key,
            command,
            correlation,
            self.config.params.table_name.as_deref(),
        ) {
            self.resolve_failed_dispatch(correlation, e);
        }
    }

    /// Remove a batch of records by id.
    pub fn remove_items(
        &self,
        ids: &[Uuid],
        cookie: Option<u64>,
        callback: Option<ResponseCallback<T>>,
    ) {
        if !self.is_ready() {
            Self::resolve(callback, self.not_ready_response(cookie));
            return;
        }

        if self.is_remote() {
            let remote = match self.remote() {
                Ok(remote) => remote,
                Err(e) => {
                    Self::resolve(
                        callback,
                        RecordResponse::failure(
                            ResponseErrorKind::Internal,
                            e.to_string(),
                            Vec::new(),
                            cookie,
                        ),
                    );
                    return;
                }
            };

            let table = self.config.params.table_name.as_deref();
            let id_list: Vec<String> = ids.iter().map(|id| format!("'{}'", id)).collect();
            let sql = format!(
                "DELETE FROM {} WHERE Id IN ({})",
                table.unwrap_or(self.store_id.as_str()),
                id_list.join(",")
            );

            let callback = callback.unwrap_or_else(|| Box::new(|_| {}));
            let correlation =
                self.requests
                    .register(self.config.params.remote_timeout, cookie, None, callback);
            if let Err(e) = remote.execute_sql(&sql, None, correlation, table) {
                self.resolve_failed_dispatch(correlation, e);
            }
            return;
        }

        let Some(cache) = self.cache_handle() else {
            Self::resolve(callback, self.not_ready_response(cookie));
            return;
        };
        let removed = cache.remove_many(ids);
        Self::resolve(callback, RecordResponse::success(removed, cookie));
    }

    // ------------------------------------------------------------------
    // Remote plumbing
    // ------------------------------------------------------------------

    /// Deliver a correlated response from the transport. A response whose
    /// request already timed out is a no-op.
    pub fn handle_remote_response(&self, correlation_id: Uuid, payload: RemotePayload) {
        let Some(request) = self.requests.take(correlation_id) else {
            return;
        };

        if let Some(message) = payload.error {
            request.resolve(RecordResponse::failure(
                ResponseErrorKind::Remote,
                message,
                Vec::new(),
                None,
            ));
            return;
        }

        let mut serialization_errors = Vec::new();
        let mut records = Vec::new();
        for value in payload.records {
            match self.codec.decode(value) {
                Ok(record) => records.push(record),
                Err(e) => serialization_errors.push(e.to_string()),
            }
        }
        request.resolve(
            RecordResponse::success(records, None).with_serialization_errors(serialization_errors),
        );
    }

    /// Execute a raw SQL statement against the remote store, correlated and
    /// timed like any other remote call.
    pub fn execute_sql(
        &self,
        sql: &str,
        column_filter: Option<&str>,
        cookie: Option<u64>,
        callback: ResponseCallback<T>,
    ) {
        if !self.is_ready() {
            callback(self.not_ready_response(cookie));
            return;
        }
        let remote = match self.remote() {
            Ok(remote) => remote,
            Err(e) => {
                callback(RecordResponse::failure(
                    ResponseErrorKind::Internal,
                    e.to_string(),
                    Vec::new(),
                    cookie,
                ));
                return;
            }
        };

        let correlation =
            self.requests
                .register(self.config.params.remote_timeout, cookie, None, callback);
        if let Err(e) = remote.execute_sql(
            sql,
            column_filter,
            correlation,
            self.config.params.table_name.as_deref(),
        ) {
            self.resolve_failed_dispatch(correlation, e);
        }
    }

    /// Toggle remote change-push notifications for this store.
    pub fn update_subscription_enabled(&self, enabled: bool) -> Result<()> {
        if self.config.params.mode == StoreMode::RamOnly {
            return Err(Error::InvalidOperation(
                "RAM-only stores have no remote subscription".to_string(),
            ));
        }
        let remote = self.remote()?;
        remote.set_subscription(self.store_id.as_str(), enabled)?;
        self.subscription_enabled.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    /// Whether remote push notifications are currently enabled.
    pub fn subscription_enabled(&self) -> bool {
        self.subscription_enabled.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // Local passthroughs
    // ------------------------------------------------------------------

    /// Register an update listener on the local cache.
    pub fn add_listener(&self, listener: UpdateListener<T>) -> Result<()> {
        match self.cache_handle() {
            Some(cache) => {
                cache.add_listener(listener);
                Ok(())
            }
            None => Err(Error::NotReady(self.store_id.as_str().to_string())),
        }
    }

    /// Look up a record by id in the local cache.
    pub fn get_by_id(&self, id: Uuid) -> Option<T> {
        self.cache_handle().and_then(|cache| cache.get_by_id(id))
    }

    /// Records after a sequence watermark, for incremental consumers.
    pub fn items_since(&self, seq: u64) -> Vec<T> {
        self.cache_handle()
            .map(|cache| cache.items_since(seq))
            .unwrap_or_default()
    }

    /// Live record count of the local cache.
    pub fn count(&self) -> usize {
        self.cache_handle().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Force a synchronous save of the local cache.
    pub fn save(&self, force: bool) {
        if let Some(cache) = self.cache_handle() {
            cache.schedule_save(true, force);
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn cache_handle(&self) -> Option<Arc<MirrorCache<T, C>>> {
        self.cache.lock().clone()
    }

    fn is_remote(&self) -> bool {
        self.config.params.mode == StoreMode::RemoteBacked
    }

    fn remote(&self) -> Result<Arc<dyn RemoteStore>> {
        self.config
            .remote
            .clone()
            .ok_or_else(|| Error::InvalidOperation("no remote store configured".to_string()))
    }

    fn not_ready_response(&self, cookie: Option<u64>) -> RecordResponse<T> {
        RecordResponse::failure(
            ResponseErrorKind::NotReady,
            format!("store {} not ready", self.store_id),
            Vec::new(),
            cookie,
        )
    }

    fn resolve(callback: Option<ResponseCallback<T>>, response: RecordResponse<T>) {
        if let Some(callback) = callback {
            callback(response);
        }
    }

    fn resolve_failed_dispatch(&self, correlation: Uuid, error: Error) {
        warn!(store = %self.store_id, error = %error, "remote dispatch failed");
        if let Some(request) = self.requests.take(correlation) {
            request.resolve(RecordResponse::failure(
                ResponseErrorKind::Remote,
                error.to_string(),
                Vec::new(),
                None,
            ));
        }
    }
}

impl<T, C> AnyStore for StorageMirror<T, C>
where
    T: Record,
    C: RecordCodec<T>,
{
    fn store_key(&self) -> String {
        self.store_id.as_str().to_string()
    }

    fn is_ready(&self) -> bool {
        StorageMirror::is_ready(self)
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirror_core::{JsonCodec, SaveCadence};
    use parking_lot::Mutex as PlMutex;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Device {
        id: Uuid,
        created_at: Timestamp,
        expires_after_secs: i64,
        sequence_number: Option<u64>,
        name: String,
        zone: u32,
    }

    impl Record for Device {
        fn id(&self) -> Uuid {
            self.id
        }
        fn set_id(&mut self, id: Uuid) {
            self.id = id;
        }
        fn created_at(&self) -> Timestamp {
            self.created_at
        }
        fn expires_after_secs(&self) -> i64 {
            self.expires_after_secs
        }
        fn sequence_number(&self) -> Option<u64> {
            self.sequence_number
        }
        fn set_sequence_number(&mut self, seq: Option<u64>) {
            self.sequence_number = seq;
        }
    }

    fn device(name: &str, zone: u32) -> Device {
        Device {
            id: Uuid::new_v4(),
            created_at: Timestamp::now(),
            expires_after_secs: 0,
            sequence_number: None,
            name: name.to_string(),
            zone,
        }
    }

    /// Records every call and its correlation id; responses are delivered
    /// manually through `handle_remote_response`.
    #[derive(Default)]
    struct FakeRemote {
        calls: PlMutex<Vec<(String, Uuid)>>,
        subscriptions: PlMutex<Vec<bool>>,
    }

    impl FakeRemote {
        fn last_correlation(&self) -> Uuid {
            self.calls.lock().last().map(|(_, id)| *id).unwrap()
        }
    }

    impl RemoteStore for FakeRemote {
        fn execute_sql(
            &self,
            _sql: &str,
            _column_filter: Option<&str>,
            correlation_id: Uuid,
            _table_name: Option<&str>,
        ) -> mirror_core::Result<()> {
            self.calls.lock().push(("execute_sql".to_string(), correlation_id));
            Ok(())
        }

        fn create_store(
            &self,
            _schema: &str,
            _defaults: Option<serde_json::Value>,
            _store_name: &str,
            _description: &str,
            _reset: bool,
            correlation_id: Uuid,
            _table_name: Option<&str>,
        ) -> mirror_core::Result<()> {
            self.calls.lock().push(("create_store".to_string(), correlation_id));
            Ok(())
        }

        fn data_store(
            &self,
            _records_by_key: HashMap<String, serde_json::Value>,
            _command: RemoteCommand,
            correlation_id: Uuid,
            _table_name: Option<&str>,
        ) -> mirror_core::Result<()> {
            self.calls.lock().push(("data_store".to_string(), correlation_id));
            Ok(())
        }

        fn request_records(
            &self,
            _store_id: &str,
            _query: &RemoteQuery,
            correlation_id: Uuid,
        ) -> mirror_core::Result<()> {
            self.calls
                .lock()
                .push(("request_records".to_string(), correlation_id));
            Ok(())
        }

        fn set_subscription(&self, _store_id: &str, enabled: bool) -> mirror_core::Result<()> {
            self.subscriptions.lock().push(enabled);
            Ok(())
        }
    }

    fn local_mirror(params: StoreParams) -> Arc<StorageMirror<Device, JsonCodec<Device>>> {
        StorageMirror::new(
            Arc::new(JsonCodec::new()),
            MirrorConfig {
                params,
                ..MirrorConfig::default()
            },
        )
    }

    fn remote_mirror_with(
        remote: Arc<FakeRemote>,
        remote_timeout: Duration,
    ) -> Arc<StorageMirror<Device, JsonCodec<Device>>> {
        StorageMirror::new(
            Arc::new(JsonCodec::new()),
            MirrorConfig {
                params: StoreParams {
                    mode: StoreMode::RemoteBacked,
                    remote_timeout,
                    ..StoreParams::default()
                },
                remote: Some(remote),
                ..MirrorConfig::default()
            },
        )
    }

    fn remote_mirror(remote: Arc<FakeRemote>) -> Arc<StorageMirror<Device, JsonCodec<Device>>> {
        remote_mirror_with(remote, Duration::from_secs(10))
    }

    fn collect_responses() -> (
        Arc<PlMutex<Vec<RecordResponse<Device>>>>,
        Arc<AtomicUsize>,
    ) {
        (
            Arc::new(PlMutex::new(Vec::new())),
            Arc::new(AtomicUsize::new(0)),
        )
    }

    fn sink_callback(
        sink: &Arc<PlMutex<Vec<RecordResponse<Device>>>>,
        count: &Arc<AtomicUsize>,
    ) -> ResponseCallback<Device> {
        let sink = Arc::clone(sink);
        let count = Arc::clone(count);
        Box::new(move |response| {
            count.fetch_add(1, Ordering::Relaxed);
            sink.lock().push(response);
        })
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams::default());

        assert_eq!(mirror.state(), StoreState::Uninitialized);
        mirror.initialize(&registry).unwrap();
        assert!(mirror.is_ready());
        mirror.initialize(&registry).unwrap();
        assert!(mirror.is_ready());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registered_under_all_keys() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams {
            table_name: Some("devices".to_string()),
            ..StoreParams::default()
        });
        mirror.initialize(&registry).unwrap();

        // Raw store id, bare fingerprint, table name, mirror id
        assert!(registry.resolve(mirror.store_id().as_str()).is_some());
        assert!(registry.resolve("devices").is_some());
        assert!(registry.resolve(&mirror.mirror_id().to_string()).is_some());

        let schema = JsonCodec::<Device>::new().schema();
        let bare = StoreId::derive(&schema, None);
        assert!(registry.resolve(bare.as_str()).is_some());

        let typed: Arc<StorageMirror<Device, JsonCodec<Device>>> =
            registry.resolve_as("devices").unwrap();
        assert_eq!(typed.store_id(), mirror.store_id());
    }

    #[test]
    fn test_not_ready_is_flagged_response() {
        let mirror = local_mirror(StoreParams::default());
        let (sink, count) = collect_responses();

        mirror.get_records(RecordQuery::default(), sink_callback(&sink, &count));

        assert_eq!(count.load(Ordering::Relaxed), 1);
        let responses = sink.lock();
        let err = responses[0].error.as_ref().unwrap();
        assert_eq!(err.kind, ResponseErrorKind::NotReady);
    }

    #[test]
    fn test_local_add_and_query_with_filter() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams::default());
        mirror.initialize(&registry).unwrap();

        mirror.add_items(
            vec![device("boiler", 1), device("pump", 1), device("valve", 2)],
            None,
            None,
        );

        let (sink, count) = collect_responses();
        mirror.get_records(
            RecordQuery {
                filter: Some("zone=1".to_string()),
                ..RecordQuery::default()
            },
            sink_callback(&sink, &count),
        );

        let responses = sink.lock();
        assert!(responses[0].is_success());
        assert_eq!(responses[0].records.len(), 2);
    }

    #[test]
    fn test_zero_match_is_error_flagged() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams::default());
        mirror.initialize(&registry).unwrap();
        mirror.add_items(vec![device("boiler", 1)], None, None);

        let (sink, count) = collect_responses();
        mirror.get_records(
            RecordQuery {
                filter: Some("zone=99".to_string()),
                cookie: Some(5),
                ..RecordQuery::default()
            },
            sink_callback(&sink, &count),
        );

        let responses = sink.lock();
        let response = &responses[0];
        assert!(response.records.is_empty());
        assert_eq!(
            response.error.as_ref().unwrap().kind,
            ResponseErrorKind::NoMatch
        );
        assert_eq!(response.cookie, Some(5));
    }

    #[test]
    fn test_invalid_filter_is_reported_not_propagated() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams::default());
        mirror.initialize(&registry).unwrap();
        mirror.add_items(vec![device("boiler", 1)], None, None);

        let (sink, count) = collect_responses();
        mirror.get_records(
            RecordQuery {
                filter: Some("zone>not-a-number".to_string()),
                ..RecordQuery::default()
            },
            sink_callback(&sink, &count),
        );

        let responses = sink.lock();
        assert_eq!(
            responses[0].error.as_ref().unwrap().kind,
            ResponseErrorKind::FilterCompile
        );
    }

    #[test]
    fn test_top_decimates_by_stride() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams {
            track_insertion_order: true,
            ..StoreParams::default()
        });
        mirror.initialize(&registry).unwrap();

        let records: Vec<Device> = (0..1_000u32)
            .map(|i| device(&format!("d{}", i), i))
            .collect();
        mirror.add_items(records, None, None);

        let (sink, count) = collect_responses();
        mirror.get_records(
            RecordQuery {
                top: Some(10),
                ..RecordQuery::default()
            },
            sink_callback(&sink, &count),
        );

        let responses = sink.lock();
        let records = &responses[0].records;
        assert_eq!(records.len(), 10);
        // Spans the whole range, stride 100
        assert_eq!(records[0].zone, 0);
        assert_eq!(records[9].zone, 900);
    }

    #[test]
    fn test_remote_initialization_completes_on_response() {
        let registry = StoreRegistry::new();
        let remote = Arc::new(FakeRemote::default());
        let mirror = remote_mirror(Arc::clone(&remote));

        mirror.initialize(&registry).unwrap();
        assert_eq!(mirror.state(), StoreState::Initializing);

        mirror.handle_remote_response(remote.last_correlation(), RemotePayload::default());
        assert!(mirror.is_ready());
    }

    #[test]
    fn test_remote_initialization_timeout_reverts() {
        let registry = StoreRegistry::new();
        let remote = Arc::new(FakeRemote::default());
        let mirror = remote_mirror_with(Arc::clone(&remote), Duration::from_millis(100));

        mirror.initialize(&registry).unwrap();
        assert_eq!(mirror.state(), StoreState::Initializing);

        // remote_timeout is 100ms; the scanner fires within ~350ms
        assert!(!mirror.wait_for_ready(Duration::from_millis(800)));
        assert_eq!(mirror.state(), StoreState::Uninitialized);
    }

    #[test]
    fn test_remote_mutation_roundtrip() {
        let registry = StoreRegistry::new();
        let remote = Arc::new(FakeRemote::default());
        let mirror = remote_mirror(Arc::clone(&remote));
        mirror.initialize(&registry).unwrap();
        mirror.handle_remote_response(remote.last_correlation(), RemotePayload::default());

        let (sink, count) = collect_responses();
        let d = device("remote-thing", 3);
        mirror.add_items(vec![d.clone()], Some(9), Some(sink_callback(&sink, &count)));

        let correlation = remote.last_correlation();
        let payload = RemotePayload {
            records: vec![serde_json::to_value(&d).unwrap()],
            error: None,
        };
        mirror.handle_remote_response(correlation, payload);

        assert_eq!(count.load(Ordering::Relaxed), 1);
        let responses = sink.lock();
        assert!(responses[0].is_success());
        assert_eq!(responses[0].records[0].name, "remote-thing");
        assert_eq!(responses[0].cookie, Some(9));

        // A duplicate response for the same correlation is a no-op
        drop(responses);
        mirror.handle_remote_response(correlation, RemotePayload::default());
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_remote_mutation_timeout_carries_pending_records() {
        let registry = StoreRegistry::new();
        let remote = Arc::new(FakeRemote::default());
        let mirror = remote_mirror_with(Arc::clone(&remote), Duration::from_millis(100));
        mirror.initialize(&registry).unwrap();
        mirror.handle_remote_response(remote.last_correlation(), RemotePayload::default());

        let (sink, count) = collect_responses();
        let d = device("unconfirmed", 1);
        mirror.add_items(vec![d.clone()], None, Some(sink_callback(&sink, &count)));

        // Never respond; the timeout scanner resolves the caller
        let deadline = Instant::now() + Duration::from_secs(2);
        while count.load(Ordering::Relaxed) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(25));
        }

        assert_eq!(count.load(Ordering::Relaxed), 1);
        let responses = sink.lock();
        let response = &responses[0];
        assert_eq!(
            response.error.as_ref().unwrap().kind,
            ResponseErrorKind::Timeout
        );
        assert_eq!(response.records.len(), 1);
        assert_eq!(response.records[0].id, d.id);
    }

    #[test]
    fn test_remote_query_routed() {
        let registry = StoreRegistry::new();
        let remote = Arc::new(FakeRemote::default());
        let mirror = remote_mirror(Arc::clone(&remote));
        mirror.initialize(&registry).unwrap();
        mirror.handle_remote_response(remote.last_correlation(), RemotePayload::default());

        let (sink, count) = collect_responses();
        mirror.get_records(
            RecordQuery {
                filter: Some("zone=1".to_string()),
                top: Some(50),
                ..RecordQuery::default()
            },
            sink_callback(&sink, &count),
        );

        let calls = remote.calls.lock();
        assert_eq!(calls.last().unwrap().0, "request_records");
    }

    #[test]
    fn test_subscription_toggles_remote() {
        let registry = StoreRegistry::new();
        let remote = Arc::new(FakeRemote::default());
        let mirror = remote_mirror(Arc::clone(&remote));
        mirror.initialize(&registry).unwrap();
        mirror.handle_remote_response(remote.last_correlation(), RemotePayload::default());

        mirror.update_subscription_enabled(true).unwrap();
        mirror.update_subscription_enabled(false).unwrap();
        assert_eq!(*remote.subscriptions.lock(), vec![true, false]);
        assert!(!mirror.subscription_enabled());
    }

    #[test]
    fn test_subscription_rejected_for_ram_only() {
        let mirror = local_mirror(StoreParams::default());
        assert!(mirror.update_subscription_enabled(true).is_err());
    }

    #[test]
    fn test_reset_returns_to_uninitialized_but_stays_registered() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams::default());
        mirror.initialize(&registry).unwrap();
        mirror.add_items(vec![device("x", 1)], None, None);

        mirror.reset().unwrap();
        assert_eq!(mirror.state(), StoreState::Uninitialized);
        assert!(registry.resolve(mirror.store_id().as_str()).is_some());
        assert_eq!(mirror.count(), 0);

        // Re-initialization starts a fresh cycle
        mirror.initialize(&registry).unwrap();
        assert!(mirror.is_ready());
    }

    #[test]
    fn test_remove_store_flushes_and_unregisters() {
        let dir = tempdir().unwrap();
        let registry = StoreRegistry::new();
        let mirror = StorageMirror::<Device, JsonCodec<Device>>::new(
            Arc::new(JsonCodec::new()),
            MirrorConfig {
                params: StoreParams {
                    mode: StoreMode::Cached,
                    persistent: true,
                    save_cadence: SaveCadence::EveryMutations(1),
                    ..StoreParams::default()
                },
                cache_root: Some(dir.path().to_path_buf()),
                ..MirrorConfig::default()
            },
        );
        mirror.initialize(&registry).unwrap();
        mirror.add_items(vec![device("persisted", 1)], None, None);

        mirror.remove_store(&registry).unwrap();
        assert!(registry.is_empty());
        assert_eq!(mirror.state(), StoreState::Uninitialized);

        // The flush left a cache file behind
        let file = dir.path().join(mirror.store_id().sanitized());
        assert!(file.exists());
    }

    #[test]
    fn test_create_seeds_defaults_once() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams::default());

        mirror
            .create(&registry, vec![device("seed-a", 1), device("seed-b", 2)], false)
            .unwrap();
        assert_eq!(mirror.count(), 2);

        // A second create is a no-op and does not re-seed
        mirror
            .create(&registry, vec![device("seed-c", 3)], false)
            .unwrap();
        assert_eq!(mirror.count(), 2);
    }

    #[test]
    fn test_wait_for_ready() {
        let registry = StoreRegistry::new();
        let mirror = local_mirror(StoreParams::default());

        assert!(!mirror.wait_for_ready(Duration::from_millis(50)));
        mirror.initialize(&registry).unwrap();
        assert!(mirror.wait_for_ready(Duration::from_millis(50)));
    }
}
