//! Per-instance execution state tracked by the coordinator.
//!
//! Concurrent accesses:
//! - dispatch marks `initiated` while holding the instance lock across the
//!   exec RPC;
//! - status reports update status/done/profile/counters under the same lock;
//! - cancellation flips still-OK instances to CANCELLED under the same lock.
//!
//! Lock ordering: the coordinator's query lock is always acquired *before*
//! any instance lock; never the reverse.

use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant};

use kite_common::ids::{HostPort, PlanNodeId, UniqueId};
use kite_common::status::ExecStatus;
use tokio::sync::Mutex;

use crate::profile::{FragmentInstanceCounters, RuntimeProfile};
use crate::wire::ExecFragmentRequest;

/// Wall-clock stopwatch measuring one instance's remote execution time.
#[derive(Debug, Default)]
pub struct WallClockStopWatch {
    state: StdMutex<StopWatchState>,
}

#[derive(Debug, Default)]
struct StopWatchState {
    started_at: Option<Instant>,
    accumulated: Duration,
}

impl WallClockStopWatch {
    /// Starts timing; a second start is ignored.
    pub fn start(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.started_at.is_none() {
            state.started_at = Some(Instant::now());
        }
    }

    /// Stops timing and accumulates the elapsed span.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(started_at) = state.started_at.take() {
            state.accumulated += started_at.elapsed();
        }
    }

    /// Total measured time in milliseconds, including a running span.
    pub fn elapsed_ms(&self) -> u64 {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let running = state
            .started_at
            .map(|started_at| started_at.elapsed())
            .unwrap_or_default();
        (state.accumulated + running).as_millis() as u64
    }
}

/// Mutable per-instance fields, guarded by the instance lock.
#[derive(Debug, Default)]
pub struct InstanceExec {
    /// Instance status; non-OK means the instance ended or is being torn
    /// down, and must not be cancelled again.
    pub status: ExecStatus,
    /// True once the exec RPC was sent successfully.
    pub initiated: bool,
    /// True once the instance reported `done`; do not cancel in that case.
    pub done: bool,
    /// True after the first profile update bound the scan-node counters.
    pub profile_created: bool,
    /// Error lines reported by this instance.
    pub error_log: Vec<String>,
    /// Scan-node counters bound from the instance profile.
    pub aggregate_counters: FragmentInstanceCounters,
    /// Completed scan ranges accounted so far, across all scan nodes.
    pub total_ranges_complete: i64,
}

impl InstanceExec {
    /// Re-sums completed-range counters and returns the (non-negative) delta
    /// since the previous call. Caller holds the instance lock.
    pub fn update_ranges_completed(&mut self) -> i64 {
        let total: i64 = self
            .aggregate_counters
            .scan_ranges_complete
            .values()
            .map(|counter| counter.value())
            .sum();
        let delta = total - self.total_ranges_complete;
        self.total_ranges_complete = total;
        debug_assert!(delta >= 0, "completed scan ranges decreased by {}", -delta);
        delta
    }
}

/// Execution state of one remote fragment instance.
#[derive(Debug)]
pub struct BackendExecState {
    /// Globally unique instance id.
    pub instance_id: UniqueId,
    /// Backend endpoint executing the instance.
    pub host: HostPort,
    /// Dense index used by status reports.
    pub backend_num: usize,
    /// Index into the request's fragment list.
    pub fragment_idx: usize,
    /// Dispatch payload, assembled at construction.
    pub rpc_params: ExecFragmentRequest,
    /// Sum of file-split lengths over all assigned scan ranges.
    pub total_split_size: i64,
    /// Wall-clock timer running from dispatch to the final report.
    pub stopwatch: WallClockStopWatch,
    /// Cumulative instance profile, updated from status reports.
    pub profile: RuntimeProfile,
    /// Mutable fields; see the module doc for the lock order.
    pub exec: Mutex<InstanceExec>,
}

impl BackendExecState {
    /// Builds the state for one instance from its dispatch payload.
    pub fn new(
        backend_num: usize,
        fragment_idx: usize,
        host: HostPort,
        rpc_params: ExecFragmentRequest,
    ) -> Self {
        let total_split_size = rpc_params.total_split_size();
        let profile = RuntimeProfile::new(format!("Instance {}", rpc_params.instance_id));
        Self {
            instance_id: rpc_params.instance_id,
            host,
            backend_num,
            fragment_idx,
            total_split_size,
            stopwatch: WallClockStopWatch::default(),
            profile,
            exec: Mutex::new(InstanceExec::default()),
            rpc_params,
        }
    }

    /// Throughput counter value of `node_id`, or 0 when that node has not
    /// reported. The counter handle is cloned under the instance lock and
    /// read outside it; counter reads never take the lock.
    pub async fn node_throughput(&self, node_id: PlanNodeId) -> i64 {
        let counter = {
            let exec = self.exec.lock().await;
            exec.aggregate_counters.throughput.get(&node_id).cloned()
        };
        counter.map_or(0, |c| c.value())
    }

    /// Completed-range counter value of `node_id`; same locking discipline as
    /// [`BackendExecState::node_throughput`].
    pub async fn ranges_completed(&self, node_id: PlanNodeId) -> i64 {
        let counter = {
            let exec = self.exec.lock().await;
            exec.aggregate_counters
                .scan_ranges_complete
                .get(&node_id)
                .cloned()
        };
        counter.map_or(0, |c| c.value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{CounterUnit, FragmentInstanceCounters};
    use std::collections::HashMap;
    use std::sync::Arc;

    fn counters_with(values: &[(i32, i64)]) -> FragmentInstanceCounters {
        let mut scan_ranges_complete = HashMap::new();
        for (id, value) in values {
            let profile = RuntimeProfile::new("n");
            let counter = profile.add_counter("ScanRangesComplete", CounterUnit::Unit);
            counter.set(*value);
            scan_ranges_complete.insert(PlanNodeId(*id), Arc::clone(&counter));
        }
        FragmentInstanceCounters {
            throughput: HashMap::new(),
            scan_ranges_complete,
        }
    }

    #[test]
    fn ranges_completed_delta_is_cumulative() {
        let mut exec = InstanceExec {
            aggregate_counters: counters_with(&[(0, 3), (1, 2)]),
            ..InstanceExec::default()
        };
        assert_eq!(exec.update_ranges_completed(), 5);

        for counter in exec.aggregate_counters.scan_ranges_complete.values() {
            counter.add(1);
        }
        assert_eq!(exec.update_ranges_completed(), 2);
        assert_eq!(exec.total_ranges_complete, 7);
    }

    #[test]
    #[should_panic(expected = "completed scan ranges decreased")]
    fn shrinking_range_counters_are_refused() {
        let mut exec = InstanceExec {
            aggregate_counters: counters_with(&[(0, 5)]),
            ..InstanceExec::default()
        };
        assert_eq!(exec.update_ranges_completed(), 5);
        exec.aggregate_counters.scan_ranges_complete[&PlanNodeId(0)].set(3);
        exec.update_ranges_completed();
    }

    #[test]
    fn stopwatch_accumulates_once() {
        let watch = WallClockStopWatch::default();
        watch.start();
        watch.start();
        watch.stop();
        watch.stop();
        // no running span after stop
        let after_stop = watch.elapsed_ms();
        assert_eq!(watch.elapsed_ms(), after_stop);
    }
}
