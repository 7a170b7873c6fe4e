//! TTL Metrics
//!
//! Thread-safe counters, gauges and duration histograms updated by the
//! select-delete loop as it runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bounds of histogram buckets, in microseconds.
///
/// Powers of four from 100us up to roughly 27 minutes; a final implicit
/// bucket catches everything above.
const BUCKET_BOUNDS_US: [u64; 13] = [
    100,
    400,
    1_600,
    6_400,
    25_600,
    102_400,
    409_600,
    1_638_400,
    6_553_600,
    26_214_400,
    104_857_600,
    419_430_400,
    1_677_721_600,
];

/// Lock-free latency histogram with fixed exponential buckets.
#[derive(Debug)]
pub struct DurationHistogram {
    buckets: [AtomicU64; BUCKET_BOUNDS_US.len() + 1],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }
}

impl DurationHistogram {
    pub fn record(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|bound| us <= *bound)
            .unwrap_or(BUCKET_BOUNDS_US.len());
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
    }

    /// Number of samples recorded.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> Duration {
        Duration::from_micros(self.sum_us.load(Ordering::Relaxed))
    }

    /// Sample counts per bucket as `(upper bound, count)`; `None` is the overflow bucket.
    pub fn buckets(&self) -> Vec<(Option<Duration>, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let bound = BUCKET_BOUNDS_US.get(i).copied().map(Duration::from_micros);
                (bound, b.load(Ordering::Relaxed))
            })
            .collect()
    }
}

/// Metrics bundle for one relation (or the shared default).
#[derive(Debug, Clone, Default)]
pub struct TtlMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Bound pairs currently being processed
    active_spans: AtomicI64,
    /// Expired keys returned by historical selects
    rows_selected: AtomicU64,
    /// Rows removed by committed delete transactions
    rows_deleted: AtomicU64,
    select_duration: DurationHistogram,
    delete_duration: DurationHistogram,
    span_total_duration: DurationHistogram,
}

impl TtlMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track one bound pair as active until the returned guard drops.
    pub fn span_started(&self) -> ActiveSpanGuard {
        self.inner.active_spans.fetch_add(1, Ordering::Relaxed);
        ActiveSpanGuard {
            metrics: self.clone(),
        }
    }

    pub fn record_rows_selected(&self, count: u64) {
        self.inner.rows_selected.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rows_deleted(&self, count: u64) {
        self.inner.rows_deleted.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_select_duration(&self, duration: Duration) {
        self.inner.select_duration.record(duration);
    }

    pub fn record_delete_duration(&self, duration: Duration) {
        self.inner.delete_duration.record(duration);
    }

    pub fn record_span_total_duration(&self, duration: Duration) {
        self.inner.span_total_duration.record(duration);
    }

    pub fn active_spans(&self) -> i64 {
        self.inner.active_spans.load(Ordering::Relaxed)
    }

    pub fn rows_selected(&self) -> u64 {
        self.inner.rows_selected.load(Ordering::Relaxed)
    }

    pub fn rows_deleted(&self) -> u64 {
        self.inner.rows_deleted.load(Ordering::Relaxed)
    }

    pub fn select_duration(&self) -> &DurationHistogram {
        &self.inner.select_duration
    }

    pub fn delete_duration(&self) -> &DurationHistogram {
        &self.inner.delete_duration
    }

    pub fn span_total_duration(&self) -> &DurationHistogram {
        &self.inner.span_total_duration
    }
}

/// Decrements the active-span gauge on drop.
#[derive(Debug)]
pub struct ActiveSpanGuard {
    metrics: TtlMetrics,
}

impl Drop for ActiveSpanGuard {
    fn drop(&mut self) {
        self.metrics
            .inner
            .active_spans
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Process-wide TTL metrics, optionally split by relation.
#[derive(Debug, Clone, Default)]
pub struct TtlAggMetrics {
    default: TtlMetrics,
    by_relation: Arc<Mutex<HashMap<String, TtlMetrics>>>,
}

impl TtlAggMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Metrics a processor should update.
    ///
    /// Tables without `label_metrics` share the unlabeled default bundle.
    pub fn metrics_for(&self, label_metrics: bool, relation: &str) -> TtlMetrics {
        if !label_metrics {
            return self.default.clone();
        }
        let mut by_relation = self
            .by_relation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        by_relation.entry(relation.to_string()).or_default().clone()
    }

    pub fn default_metrics(&self) -> &TtlMetrics {
        &self.default
    }

    /// Labeled bundle for `relation`, if one was ever created.
    pub fn relation(&self, relation: &str) -> Option<TtlMetrics> {
        self.by_relation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(relation)
            .cloned()
    }
}
