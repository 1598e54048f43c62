//! Local query evaluation: ordering, paging, decimation
//!
//! Only the creation-time ascending/descending orders are natively
//! evaluated; any other order is an opaque hint meant for a remote store and
//! is ignored locally. The default order is insertion sequence when tracked,
//! falling back to creation time.
//!
//! When `top` is smaller than the match count and no page is requested, the
//! result is decimated by deterministic stride sampling (every nth item,
//! n = ceil(total/top)) so a "top 100 of 10,000" request spans the whole
//! range instead of truncating to the first 100. Dashboards depend on this;
//! it is not truncation by accident.

use mirror_core::Record;
use tracing::debug;

/// Requested result order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RecordOrder {
    /// Insertion sequence when tracked, else creation time ascending
    #[default]
    Default,
    /// Creation time, oldest first
    CreatedAscending,
    /// Creation time, newest first
    CreatedDescending,
    /// Opaque hint for a remote store; ignored locally
    Passthrough(String),
}

/// Paging and ordering options for a query.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Result cap; triggers stride decimation when below the match count
    pub top: Option<usize>,
    /// Zero-based page index; switches `top` from decimation to windowing
    pub page: Option<usize>,
    /// Result order
    pub order: RecordOrder,
}

/// Order, page, and decimate a matched record set.
pub fn evaluate<T: Record>(mut records: Vec<T>, options: &QueryOptions) -> Vec<T> {
    match &options.order {
        RecordOrder::Default => {
            records.sort_by_key(|r| (r.sequence_number(), r.created_at(), r.id()));
        }
        RecordOrder::CreatedAscending => {
            records.sort_by_key(|r| (r.created_at(), r.id()));
        }
        RecordOrder::CreatedDescending => {
            records.sort_by_key(|r| (r.created_at(), r.id()));
            records.reverse();
        }
        RecordOrder::Passthrough(hint) => {
            debug!(order = %hint, "opaque order hint ignored for local evaluation");
            records.sort_by_key(|r| (r.sequence_number(), r.created_at(), r.id()));
        }
    }

    let Some(top) = options.top.filter(|&t| t > 0) else {
        return records;
    };

    if let Some(page) = options.page {
        return records.into_iter().skip(page * top).take(top).collect();
    }

    if records.len() <= top {
        return records;
    }
    stride_sample(records, top)
}

/// Deterministic stride sampling: keep every nth item, n = ceil(total/top).
fn stride_sample<T>(records: Vec<T>, top: usize) -> Vec<T> {
    let stride = (records.len() + top - 1) / top;
    records
        .into_iter()
        .step_by(stride)
        .take(top)
        .collect()
}
