//! Timed request/response correlation
//!
//! Every remote call registers a [`TimedRequest`] keyed by a fresh
//! correlation id. The entry is consumed exactly once: by the response
//! (whoever routes it calls [`TimedRequests::take`]) or by the timeout
//! scanner, whichever removes it first; the other becomes a no-op. A
//! timeout synthesizes an error response carrying whatever partial record
//! set was pending, so callers are always resolved.

use crate::response::{RecordResponse, ResponseCallback, ResponseErrorKind};
use dashmap::DashMap;
use mirror_storage::Sweeper;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// One outstanding correlated remote call.
pub struct TimedRequest<T> {
    correlation_id: Uuid,
    callback: ResponseCallback<T>,
    deadline: Instant,
    cookie: Option<u64>,
    pending_records: Option<HashMap<String, T>>,
}

impl<T> TimedRequest<T> {
    /// The caller's correlation cookie, if any.
    pub fn cookie(&self) -> Option<u64> {
        self.cookie
    }

    /// Resolve with a response, consuming the request. The cookie is
    /// attached when the response does not already carry one.
    pub fn resolve(self, mut response: RecordResponse<T>) {
        if response.cookie.is_none() {
            response.cookie = self.cookie;
        }
        (self.callback)(response);
    }

    fn resolve_timeout(self) {
        let records: Vec<T> = self
            .pending_records
            .map(|pending| pending.into_values().collect())
            .unwrap_or_default();
        warn!(correlation = %self.correlation_id, "remote request timed out");
        let response = RecordResponse::failure(
            ResponseErrorKind::Timeout,
            format!("request {} timed out", self.correlation_id),
            records,
            self.cookie,
        );
        (self.callback)(response);
    }
}

/// Correlation table for one store's outstanding remote calls.
pub struct TimedRequests<T> {
    requests: DashMap<Uuid, TimedRequest<T>>,
    timer: Mutex<Option<Sweeper>>,
}

impl<T: Send + Sync + 'static> TimedRequests<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        TimedRequests {
            requests: DashMap::new(),
            timer: Mutex::new(None),
        }
    }

    /// Register a new request and return its correlation id.
    ///
    /// `pending_records` is the record set the caller was trying to push;
    /// it rides along in the timeout response so the caller knows what was
    /// left unconfirmed.
    pub fn register(
        &self,
        timeout: Duration,
        cookie: Option<u64>,
        pending_records: Option<HashMap<String, T>>,
        callback: ResponseCallback<T>,
    ) -> Uuid {
        let correlation_id = Uuid::new_v4();
        self.requests.insert(
            correlation_id,
            TimedRequest {
                correlation_id,
                callback,
                deadline: Instant::now() + timeout,
                cookie,
                pending_records,
            },
        );
        correlation_id
    }

    /// Consume the request for a correlation id, if it is still pending.
    ///
    /// Returns `None` when the id is unknown or its timeout already fired.
    pub fn take(&self, correlation_id: Uuid) -> Option<TimedRequest<T>> {
        match self.requests.remove(&correlation_id) {
            Some((_, request)) => Some(request),
            None => {
                debug!(correlation = %correlation_id, "response for consumed request ignored");
                None
            }
        }
    }

    /// Resolve every request whose deadline has passed.
    pub fn expire_due(&self) {
        let now = Instant::now();
        let due: Vec<Uuid> = self
            .requests
            .iter()
            .filter(|entry| entry.deadline <= now)
            .map(|entry| *entry.key())
            .collect();

        for correlation_id in due {
            if let Some((_, request)) = self.requests.remove(&correlation_id) {
                request.resolve_timeout();
            }
        }
    }

    /// Outstanding request count.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Start the timeout scanner thread.
    pub fn start_timer(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let sweeper = Sweeper::start("timed-requests".to_string(), interval, move || {
            if let Some(requests) = weak.upgrade() {
                requests.expire_due();
            }
        });
        *self.timer.lock() = Some(sweeper);
    }

    /// Stop the timeout scanner thread.
    pub fn stop_timer(&self) {
        if let Some(mut timer) = self.timer.lock().take() {
            timer.stop();
        }
    }
}

impl<T: Send + Sync + 'static> Default for TimedRequests<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for TimedRequests<T> {
    fn drop(&mut self) {
        if let Some(mut timer) = self.timer.lock().take() {
            timer.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn collector() -> (
        Arc<Mutex<Vec<RecordResponse<String>>>>,
        Arc<AtomicUsize>,
    ) {
        (Arc::new(Mutex::new(Vec::new())), Arc::new(AtomicUsize::new(0)))
    }

    fn callback(
        sink: &Arc<Mutex<Vec<RecordResponse<String>>>>,
        count: &Arc<AtomicUsize>,
    ) -> ResponseCallback<String> {
        let sink = Arc::clone(sink);
        let count = Arc::clone(count);
        Box::new(move |response| {
            count.fetch_add(1, Ordering::Relaxed);
            sink.lock().push(response);
        })
    }

    #[test]
    fn test_response_consumes_request() {
        let requests: TimedRequests<String> = TimedRequests::new();
        let (sink, count) = collector();

        let id = requests.register(
            Duration::from_secs(60),
            Some(7),
            None,
            callback(&sink, &count),
        );
        assert_eq!(requests.len(), 1);

        let request = requests.take(id).unwrap();
        request.resolve(RecordResponse::success(vec!["ok".to_string()], None));

        assert!(requests.is_empty());
        assert_eq!(count.load(Ordering::Relaxed), 1);
        let responses = sink.lock();
        assert!(responses[0].is_success());
        // Cookie attached from the request
        assert_eq!(responses[0].cookie, Some(7));
    }

    #[test]
    fn test_timeout_synthesizes_error_with_pending_records() {
        let requests: TimedRequests<String> = TimedRequests::new();
        let (sink, count) = collector();

        let mut pending = HashMap::new();
        pending.insert("k1".to_string(), "unconfirmed".to_string());

        requests.register(
            Duration::from_millis(0),
            None,
            Some(pending),
            callback(&sink, &count),
        );

        thread::sleep(Duration::from_millis(10));
        requests.expire_due();

        assert_eq!(count.load(Ordering::Relaxed), 1);
        let responses = sink.lock();
        let err = responses[0].error.as_ref().unwrap();
        assert_eq!(err.kind, ResponseErrorKind::Timeout);
        assert_eq!(responses[0].records, vec!["unconfirmed".to_string()]);
    }

    #[test]
    fn test_response_and_timeout_mutually_exclusive() {
        let requests: TimedRequests<String> = TimedRequests::new();
        let (sink, count) = collector();

        let id = requests.register(
            Duration::from_millis(0),
            None,
            None,
            callback(&sink, &count),
        );

        // Response wins the race; the later timeout scan is a no-op
        let request = requests.take(id).unwrap();
        request.resolve(RecordResponse::success(vec![], None));
        thread::sleep(Duration::from_millis(10));
        requests.expire_due();

        assert_eq!(count.load(Ordering::Relaxed), 1);

        // And the reverse: a timeout consumes the entry first
        let id = requests.register(
            Duration::from_millis(0),
            None,
            None,
            callback(&sink, &count),
        );
        thread::sleep(Duration::from_millis(10));
        requests.expire_due();
        assert!(requests.take(id).is_none());
        assert_eq!(count.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unexpired_requests_survive_scan() {
        let requests: TimedRequests<String> = TimedRequests::new();
        let (sink, count) = collector();

        requests.register(
            Duration::from_secs(60),
            None,
            None,
            callback(&sink, &count),
        );
        requests.expire_due();

        assert_eq!(requests.len(), 1);
        assert_eq!(count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_timer_thread_expires_requests() {
        let requests: Arc<TimedRequests<String>> = Arc::new(TimedRequests::new());
        let (sink, count) = collector();

        requests.register(
            Duration::from_millis(50),
            None,
            None,
            callback(&sink, &count),
        );
        requests.start_timer(Duration::from_millis(20));

        thread::sleep(Duration::from_millis(400));
        assert_eq!(count.load(Ordering::Relaxed), 1);
        requests.stop_timer();
    }
}
