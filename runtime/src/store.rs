//! In-memory record of mirror actions.
//!
//! Newest records first, bounded by a retention count. Summary counters cover
//! every record ever written and are not reduced by eviction.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use ci_mirror_core::error::{MirrorError, Result};
use ci_mirror_core::reference::ImageReference;

/// Default number of records kept.
pub const DEFAULT_RETENTION: usize = 1000;

/// Outcome of one mirror attempt. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub source: ImageReference,
    pub destination: String,
    pub cluster: String,
    pub observed_at: DateTime<Utc>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MirrorRecord {
    pub fn succeeded(
        source: ImageReference,
        destination: impl Into<String>,
        cluster: impl Into<String>,
    ) -> Self {
        Self {
            source,
            destination: destination.into(),
            cluster: cluster.into(),
            observed_at: Utc::now(),
            success: true,
            error: None,
        }
    }

    pub fn failed(
        source: ImageReference,
        destination: impl Into<String>,
        cluster: impl Into<String>,
        error: impl ToString,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
            ..Self::succeeded(source, destination, cluster)
        }
    }
}

/// Success and failure counts for one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceCounts {
    pub succeeded: u64,
    pub failed: u64,
}

/// Aggregate view over every record written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorSummary {
    pub total: u64,
    pub retained: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub namespaces: BTreeMap<String, NamespaceCounts>,
    pub last_observed_at: Option<DateTime<Utc>>,
}

struct StoreInner {
    records: VecDeque<MirrorRecord>,
    total: u64,
    succeeded: u64,
    failed: u64,
    namespaces: BTreeMap<String, NamespaceCounts>,
    last_observed_at: Option<DateTime<Utc>>,
}

/// Bounded, concurrently readable record store.
pub struct MirrorStore {
    retention: usize,
    inner: RwLock<StoreInner>,
}

impl MirrorStore {
    /// Create a store keeping at most `retention` records (minimum 1).
    pub fn new(retention: usize) -> Self {
        let retention = retention.max(1);
        Self {
            retention,
            inner: RwLock::new(StoreInner {
                records: VecDeque::with_capacity(retention.min(DEFAULT_RETENTION)),
                total: 0,
                succeeded: 0,
                failed: 0,
                namespaces: BTreeMap::new(),
                last_observed_at: None,
            }),
        }
    }

    pub fn retention(&self) -> usize {
        self.retention
    }

    /// Add a record at the front, evicting the oldest past the retention cap.
    pub fn record(&self, record: MirrorRecord) {
        let mut guard = self.inner.write();
        let inner = &mut *guard;

        inner.total += 1;
        let counts = inner
            .namespaces
            .entry(record.source.namespace.clone())
            .or_default();
        if record.success {
            counts.succeeded += 1;
            inner.succeeded += 1;
        } else {
            counts.failed += 1;
            inner.failed += 1;
        }
        inner.last_observed_at = Some(
            inner
                .last_observed_at
                .map_or(record.observed_at, |last| last.max(record.observed_at)),
        );

        inner.records.push_front(record);
        inner.records.truncate(self.retention);
    }

    /// The `n` most recent records, newest first, and the all-time total.
    pub fn show(&self, n: i64) -> Result<(Vec<MirrorRecord>, u64)> {
        if n < 0 {
            return Err(MirrorError::InvalidLimit(n));
        }
        let n = usize::try_from(n).unwrap_or(usize::MAX);

        let inner = self.inner.read();
        let records = inner.records.iter().take(n).cloned().collect();
        Ok((records, inner.total))
    }

    pub fn summarize(&self) -> MirrorSummary {
        let inner = self.inner.read();
        MirrorSummary {
            total: inner.total,
            retained: inner.records.len(),
            succeeded: inner.succeeded,
            failed: inner.failed,
            namespaces: inner.namespaces.clone(),
            last_observed_at: inner.last_observed_at,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MirrorStore {
    fn default() -> Self {
        Self::new(DEFAULT_RETENTION)
    }
}
