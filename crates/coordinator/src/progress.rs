//! Query-wide progress tracking and result summary stats.

use std::sync::atomic::{AtomicI64, Ordering};

use tracing::info;

/// Tracks scan ranges completed across all instances of a query.
///
/// The completed count is non-decreasing: callers feed it the per-report
/// delta computed by each instance's bookkeeping, which is asserted
/// non-negative.
#[derive(Debug)]
pub struct ProgressUpdater {
    label: String,
    total: i64,
    num_complete: AtomicI64,
    /// Log once whenever progress crosses a multiple of this percentage.
    stride_percent: u8,
    last_logged_percent: AtomicI64,
}

impl ProgressUpdater {
    /// Creates a tracker expecting `total` ranges overall.
    pub fn new(label: impl Into<String>, total: i64, stride_percent: u8) -> Self {
        Self {
            label: label.into(),
            total,
            num_complete: AtomicI64::new(0),
            stride_percent: stride_percent.clamp(1, 100),
            last_logged_percent: AtomicI64::new(0),
        }
    }

    /// Folds in newly completed ranges.
    pub fn update(&self, delta: i64) {
        debug_assert!(delta >= 0, "progress delta went negative: {delta}");
        if delta == 0 {
            return;
        }
        let complete = self.num_complete.fetch_add(delta, Ordering::Relaxed) + delta;
        if self.total <= 0 {
            return;
        }
        let percent = (complete * 100 / self.total).min(100);
        let stride = self.stride_percent as i64;
        let logged = self.last_logged_percent.load(Ordering::Relaxed);
        if percent / stride > logged / stride
            && self
                .last_logged_percent
                .compare_exchange(logged, percent, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            info!(
                label = %self.label,
                complete,
                total = self.total,
                percent,
                operator = "ProgressUpdater",
                "query progress"
            );
        }
    }

    /// Ranges completed so far.
    pub fn num_complete(&self) -> i64 {
        self.num_complete.load(Ordering::Relaxed)
    }

    /// Expected total ranges.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// Whether every expected range completed.
    pub fn done(&self) -> bool {
        self.num_complete() >= self.total
    }
}

/// Whether a query streams rows to the caller or writes a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryType {
    /// Rows stream back through `get_next`.
    Select,
    /// Rows are written by table sinks and finalized on the filesystem.
    Insert,
}

/// Summary statistics a coordinator keeps about a single query.
///
/// Plain atomics rather than profile counters: these are required for correct
/// operation (result accounting), not just observability.
#[derive(Debug)]
pub struct ExecStats {
    query_type: QueryType,
    num_rows: AtomicI64,
}

impl ExecStats {
    /// Creates stats for one query.
    pub fn new(query_type: QueryType) -> Self {
        Self {
            query_type,
            num_rows: AtomicI64::new(0),
        }
    }

    /// Whether the query is a bulk insert.
    pub fn is_insert(&self) -> bool {
        self.query_type == QueryType::Insert
    }

    /// Rows returned, or written to a table sink, so far.
    pub fn num_rows(&self) -> i64 {
        self.num_rows.load(Ordering::Relaxed)
    }

    /// Accounts rows from one result batch.
    pub fn add_rows(&self, rows: i64) {
        self.num_rows.fetch_add(rows, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::{ExecStats, ProgressUpdater, QueryType};

    #[test]
    fn progress_accumulates_deltas() {
        let progress = ProgressUpdater::new("Query q", 10, 10);
        progress.update(4);
        progress.update(0);
        progress.update(6);
        assert_eq!(progress.num_complete(), 10);
        assert!(progress.done());
    }

    #[test]
    #[should_panic(expected = "progress delta went negative")]
    fn negative_delta_is_refused() {
        let progress = ProgressUpdater::new("Query q", 10, 10);
        progress.update(5);
        progress.update(-2);
    }

    #[test]
    fn exec_stats_count_rows() {
        let stats = ExecStats::new(QueryType::Select);
        stats.add_rows(100);
        stats.add_rows(28);
        assert_eq!(stats.num_rows(), 128);
        assert!(!stats.is_insert());
    }
}
