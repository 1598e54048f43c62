//! Reader/writer lock with timed, retried acquisition and upgrade routing
//!
//! Every acquisition uses a bounded timeout and is retried until it succeeds,
//! logging each blocked attempt. Acquisition is eventually blocking, never
//! best-effort: callers always get the lock, the timeout only bounds how long
//! a single attempt may go unobserved.
//!
//! ## Upgrade routing
//!
//! Once any caller has used [`UpgradeLock::upgradeable_read`] on an instance,
//! subsequent plain [`UpgradeLock::write`] calls are routed through
//! upgradable-read + upgrade. A direct writer queued behind an upgrade-reader
//! can block readers that the upgrade-reader is itself waiting on (merge
//! operations iterate sibling collections while holding the upgradable slot),
//! so after the first upgradeable use all writers take the same path. The
//! flag lives inside the lock, not beside it.

use parking_lot::{RwLock, RwLockReadGuard, RwLockUpgradableReadGuard, RwLockWriteGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;

/// Default bound on a single acquisition attempt.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(250);

/// Reader/writer lock wrapper with timeout-retried acquisition, read
/// recursion, and upgradeable reads.
///
/// Multiple plain readers may hold the lock concurrently; at most one
/// upgradable reader or writer exists at a time.
pub struct UpgradeLock<T> {
    inner: RwLock<T>,
    upgrade_used: AtomicBool,
    timeout: Duration,
    name: String,
}

impl<T> UpgradeLock<T> {
    /// Create a lock with the default acquisition timeout.
    pub fn new(name: impl Into<String>, value: T) -> Self {
        Self::with_timeout(name, value, DEFAULT_LOCK_TIMEOUT)
    }

    /// Create a lock with an explicit acquisition timeout.
    pub fn with_timeout(name: impl Into<String>, value: T, timeout: Duration) -> Self {
        UpgradeLock {
            inner: RwLock::new(value),
            upgrade_used: AtomicBool::new(false),
            timeout,
            name: name.into(),
        }
    }

    /// Run `f` under a shared read guard.
    ///
    /// Reads are recursive: a thread already holding a read guard can
    /// re-enter without deadlocking behind a queued writer.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.acquire_read();
        f(&guard)
    }

    /// Run `f` under an exclusive write guard.
    ///
    /// Routed through upgradable-read + upgrade once any caller has used
    /// [`upgradeable_read`](Self::upgradeable_read) on this instance.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        if self.upgrade_used.load(Ordering::Acquire) {
            let upgradable = self.acquire_upgradable();
            let mut guard = self.upgrade(upgradable);
            f(&mut guard)
        } else {
            let mut guard = self.acquire_write();
            f(&mut guard)
        }
    }

    /// Two-phase read-then-maybe-write.
    ///
    /// Acquires the single upgradable slot and runs `decide` against the
    /// shared state. If it returns `Some`, the guard is upgraded to exclusive
    /// and `apply` runs with the decision value; otherwise nothing is written
    /// and `None` is returned. Plain readers continue running during the
    /// `decide` phase.
    pub fn upgradeable_read<D, R>(
        &self,
        decide: impl FnOnce(&T) -> Option<D>,
        apply: impl FnOnce(&mut T, D) -> R,
    ) -> Option<R> {
        self.upgrade_used.store(true, Ordering::Release);

        let upgradable = self.acquire_upgradable();
        let decision = decide(&upgradable)?;
        let mut guard = self.upgrade(upgradable);
        Some(apply(&mut guard, decision))
    }

    /// Whether a writer or upgrade-in-progress currently holds the lock.
    ///
    /// Point-in-time observation; used by the save rate limiter to skip
    /// non-critical snapshots while a writer is active.
    pub fn is_exclusively_held(&self) -> bool {
        self.inner.is_locked_exclusive()
    }

    /// Whether upgradeable mode has ever been used on this instance.
    pub fn has_used_upgrade(&self) -> bool {
        self.upgrade_used.load(Ordering::Acquire)
    }

    fn acquire_read(&self) -> RwLockReadGuard<'_, T> {
        let mut attempts = 0u32;
        loop {
            if let Some(guard) = self.inner.try_read_recursive_for(self.timeout) {
                return guard;
            }
            attempts += 1;
            warn!(
                lock = %self.name,
                attempts,
                timeout_ms = self.timeout.as_millis() as u64,
                "read acquisition blocked, retrying"
            );
        }
    }

    fn acquire_write(&self) -> RwLockWriteGuard<'_, T> {
        let mut attempts = 0u32;
        loop {
            if let Some(guard) = self.inner.try_write_for(self.timeout) {
                return guard;
            }
            attempts += 1;
            warn!(
                lock = %self.name,
                attempts,
                timeout_ms = self.timeout.as_millis() as u64,
                "write acquisition blocked, retrying"
            );
        }
    }

    fn acquire_upgradable(&self) -> RwLockUpgradableReadGuard<'_, T> {
        let mut attempts = 0u32;
        loop {
            if let Some(guard) = self.inner.try_upgradable_read_for(self.timeout) {
                return guard;
            }
            attempts += 1;
            warn!(
                lock = %self.name,
                attempts,
                timeout_ms = self.timeout.as_millis() as u64,
                "upgradable acquisition blocked, retrying"
            );
        }
    }

    fn upgrade<'a>(
        &self,
        mut guard: RwLockUpgradableReadGuard<'a, T>,
    ) -> RwLockWriteGuard<'a, T> {
        let mut attempts = 0u32;
        loop {
            match RwLockUpgradableReadGuard::try_upgrade_for(guard, self.timeout) {
                Ok(write) => return write,
                Err(returned) => {
                    guard = returned;
                    attempts += 1;
                    warn!(
                        lock = %self.name,
                        attempts,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "upgrade blocked, retrying"
                    );
                }
            }
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for UpgradeLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpgradeLock")
            .field("name", &self.name)
            .field("upgrade_used", &self.upgrade_used.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
