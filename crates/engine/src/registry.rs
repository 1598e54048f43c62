//! Store registry with multi-key lookup
//!
//! An explicit registry value owned by the runtime and passed by reference,
//! so other subsystems can resolve a store by any of its registered keys:
//! raw store id, schema-fingerprint id, friendly table name, or internal
//! mirror id. No hidden global state.

use dashmap::DashMap;
use std::any::Any;
use std::sync::Arc;
use tracing::debug;

/// Type-erased handle to a registered store.
pub trait AnyStore: Send + Sync {
    /// The store's primary id key.
    fn store_key(&self) -> String;

    /// Whether the store has completed initialization.
    fn is_ready(&self) -> bool;

    /// Upcast for typed resolution.
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Registry mapping every lookup key to its store.
#[derive(Default)]
pub struct StoreRegistry {
    stores: DashMap<String, Arc<dyn AnyStore>>,
    keys_by_store: DashMap<String, Vec<String>>,
}

impl StoreRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a store under all of its lookup keys.
    ///
    /// Re-registering the same store replaces its previous key set.
    pub fn register(&self, keys: Vec<String>, store: Arc<dyn AnyStore>) {
        let primary = store.store_key();
        self.unregister(&primary);

        for key in &keys {
            self.stores.insert(key.clone(), Arc::clone(&store));
        }
        debug!(store = %primary, key_count = keys.len(), "store registered");
        self.keys_by_store.insert(primary, keys);
    }

    /// Remove a store and every key it was registered under.
    pub fn unregister(&self, primary_key: &str) {
        if let Some((_, keys)) = self.keys_by_store.remove(primary_key) {
            for key in keys {
                self.stores.remove(&key);
            }
            debug!(store = %primary_key, "store unregistered");
        }
    }

    /// Resolve a store by any of its registered keys.
    pub fn resolve(&self, key: &str) -> Option<Arc<dyn AnyStore>> {
        self.stores.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Resolve and downcast to a concrete store type.
    pub fn resolve_as<S: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<S>> {
        self.resolve(key)?.as_any_arc().downcast::<S>().ok()
    }

    /// Number of distinct registered stores.
    pub fn len(&self) -> usize {
        self.keys_by_store.len()
    }

    /// Whether no stores are registered.
    pub fn is_empty(&self) -> bool {
        self.keys_by_store.is_empty()
    }
}
