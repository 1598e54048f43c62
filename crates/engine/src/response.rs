//! Query and mutation responses
//!
//! Every asynchronous store operation resolves exactly once, either with a
//! success payload or an error-flagged payload carrying a human-readable
//! message. Expected conditions (not ready, zero matches, timeouts) are
//! flagged responses, never panics, and per-record serialization failures
//! are accumulated alongside the result instead of failing the batch.

use mirror_core::Error;

/// What went wrong, when a response is error-flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseErrorKind {
    /// Store has not completed initialization
    NotReady,
    /// The correlated remote request expired
    Timeout,
    /// The filter matched no records
    NoMatch,
    /// The filter expression failed to compile
    FilterCompile,
    /// The remote store reported an error
    Remote,
    /// A local store operation failed
    Internal,
}

/// Error flag attached to a response.
#[derive(Debug, Clone)]
pub struct ResponseError {
    /// Error classification
    pub kind: ResponseErrorKind,
    /// Human-readable message
    pub message: String,
}

/// Result of a query or mutation against a store.
#[derive(Debug, Clone)]
pub struct RecordResponse<T> {
    /// Matched, stored, or partially-pending records
    pub records: Vec<T>,
    /// Set when the operation did not fully succeed
    pub error: Option<ResponseError>,
    /// Per-record encode/decode failures, collected rather than fatal
    pub serialization_errors: Vec<String>,
    /// Caller-supplied correlation cookie, passed back verbatim
    pub cookie: Option<u64>,
}

impl<T> RecordResponse<T> {
    /// A successful response.
    pub fn success(records: Vec<T>, cookie: Option<u64>) -> Self {
        RecordResponse {
            records,
            error: None,
            serialization_errors: Vec::new(),
            cookie,
        }
    }

    /// An error-flagged response. `records` may carry partial results
    /// (e.g., the pending set of a timed-out mutation).
    pub fn failure(
        kind: ResponseErrorKind,
        message: impl Into<String>,
        records: Vec<T>,
        cookie: Option<u64>,
    ) -> Self {
        RecordResponse {
            records,
            error: Some(ResponseError {
                kind,
                message: message.into(),
            }),
            serialization_errors: Vec::new(),
            cookie,
        }
    }

    /// Whether the operation fully succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    /// Attach accumulated serialization errors.
    pub fn with_serialization_errors(mut self, errors: Vec<String>) -> Self {
        self.serialization_errors = errors;
        self
    }
}

impl ResponseErrorKind {
    /// Map an internal error to its response classification.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::NotReady(_) => ResponseErrorKind::NotReady,
            Error::Timeout(_) => ResponseErrorKind::Timeout,
            Error::FilterCompile(_) => ResponseErrorKind::FilterCompile,
            _ => ResponseErrorKind::Internal,
        }
    }
}

/// Callback receiving a response; invoked exactly once.
pub type ResponseCallback<T> = Box<dyn FnOnce(RecordResponse<T>) + Send + Sync>;
