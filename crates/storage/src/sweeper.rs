//! Background sweep task
//!
//! Runs a tick closure on a fixed interval in a dedicated thread. Sleeps are
//! sliced so shutdown is observed promptly, and the first tick only fires
//! after a full interval. Owned by the store; stopped on drop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::debug;

/// Handle to a background sweep thread.
pub struct Sweeper {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Spawn a sweep thread running `tick` every `interval`.
    pub fn start(name: String, interval: Duration, mut tick: impl FnMut() + Send + 'static) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&shutdown);

        let handle = thread::spawn(move || {
            debug!(sweeper = %name, "sweep thread started");
            while !flag.load(Ordering::Relaxed) {
                // Sliced sleep so shutdown is observed within ~100ms
                let slice = Duration::from_millis(100).min(interval);
                let mut elapsed = Duration::ZERO;
                while elapsed < interval {
                    if flag.load(Ordering::Relaxed) {
                        debug!(sweeper = %name, "sweep thread stopped");
                        return;
                    }
                    thread::sleep(slice);
                    elapsed += slice;
                }
                tick();
            }
            debug!(sweeper = %name, "sweep thread stopped");
        });

        Sweeper {
            shutdown,
            handle: Some(handle),
        }
    }

    /// Signal shutdown and join the thread.
    ///
    /// Joining is skipped when called from the sweep thread itself (a tick
    /// holding the last reference to its owner drops it from inside).
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
