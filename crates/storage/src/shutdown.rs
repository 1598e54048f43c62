//! Process-wide in-flight write tracking
//!
//! Every save and append increments this counter before touching disk and
//! decrements it when done, so orderly shutdown can wait for in-flight
//! writes to drain before the process exits.

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use std::time::Duration;

struct InFlight {
    count: Mutex<usize>,
    drained: Condvar,
}

static IN_FLIGHT: Lazy<InFlight> = Lazy::new(|| InFlight {
    count: Mutex::new(0),
    drained: Condvar::new(),
});

/// Guard representing one in-flight disk write.
///
/// Created by [`begin_write`]; the counter is decremented on drop, even if
/// the write path unwinds.
#[must_use = "the write is only tracked while the guard is alive"]
pub struct WriteGuard(());

impl Drop for WriteGuard {
    fn drop(&mut self) {
        let mut count = IN_FLIGHT.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            IN_FLIGHT.drained.notify_all();
        }
    }
}

/// Register an in-flight write.
pub fn begin_write() -> WriteGuard {
    *IN_FLIGHT.count.lock() += 1;
    WriteGuard(())
}

/// Number of writes currently in flight.
pub fn in_flight_writes() -> usize {
    *IN_FLIGHT.count.lock()
}

/// Block until all in-flight writes have drained or the timeout elapses.
///
/// Returns `true` when drained.
pub fn wait_for_writes(timeout: Duration) -> bool {
    let mut count = IN_FLIGHT.count.lock();
    if *count == 0 {
        return true;
    }
    IN_FLIGHT.drained.wait_for(&mut count, timeout);
    *count == 0
}
