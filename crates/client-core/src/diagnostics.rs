//! Bounded diagnostics log for classified failures.

use std::collections::{BTreeMap, VecDeque};

use client_transport::RawFailure;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorClass, ErrorRecord, classify};

/// Ring buffer capacity; the oldest record is evicted beyond this.
pub const ERROR_LOG_CAPACITY: usize = 100;

/// Number of records surfaced in [`ErrorReport::recent_errors`].
const RECENT_ERRORS_LIMIT: usize = 10;

/// Shared, bounded log of every classified failure.
///
/// Breakdown counts cover the retained window only (the last
/// [`ERROR_LOG_CAPACITY`] records); `total_errors` counts all-time.
#[derive(Debug, Default)]
pub struct ErrorLog {
    inner: Mutex<LogState>,
}

#[derive(Debug, Default)]
struct LogState {
    records: VecDeque<ErrorRecord>,
    total: u64,
}

/// Aggregated diagnostic snapshot for error screens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorReport {
    pub total_errors: u64,
    /// Count per classification label within the retained window.
    pub errors_by_type: BTreeMap<String, u64>,
    /// Count per HTTP status within the retained window.
    pub errors_by_status: BTreeMap<u16, u64>,
    /// Most recent records, newest first.
    pub recent_errors: Vec<ErrorRecord>,
    pub retryable_errors: u64,
    pub network_errors: u64,
}

impl ErrorLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Classify a raw failure and retain the record.
    pub fn classify_and_record(&self, failure: &RawFailure) -> ErrorRecord {
        let record = classify(failure);
        self.record(record.clone());
        record
    }

    /// Retain an already-built record, evicting the oldest at capacity.
    pub fn record(&self, record: ErrorRecord) {
        let mut state = self.inner.lock();
        if state.records.len() >= ERROR_LOG_CAPACITY {
            state.records.pop_front();
        }
        state.records.push_back(record);
        state.total += 1;
    }

    /// Number of records currently retained.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Drop all retained records and reset the all-time counter.
    pub fn clear(&self) {
        let mut state = self.inner.lock();
        state.records.clear();
        state.total = 0;
    }

    /// Build the aggregated report over the retained window.
    pub fn report(&self) -> ErrorReport {
        let state = self.inner.lock();

        let mut errors_by_type = BTreeMap::new();
        let mut errors_by_status = BTreeMap::new();
        let mut retryable_errors = 0;
        let mut network_errors = 0;

        for record in &state.records {
            *errors_by_type
                .entry(record.classification.label().to_owned())
                .or_insert(0) += 1;
            if let Some(status) = record.http_status {
                *errors_by_status.entry(status).or_insert(0) += 1;
            }
            if record.retryable {
                retryable_errors += 1;
            }
            if record.classification == ErrorClass::Network {
                network_errors += 1;
            }
        }

        let recent_errors = state
            .records
            .iter()
            .rev()
            .take(RECENT_ERRORS_LIMIT)
            .cloned()
            .collect();

        ErrorReport {
            total_errors: state.total,
            errors_by_type,
            errors_by_status,
            recent_errors,
            retryable_errors,
            network_errors,
        }
    }
}
