//! Per-query dispatch, status aggregation, and cancellation.
//!
//! Responsibilities:
//! - plan execution hosts and scan-range assignment for every fragment;
//! - prepare the local root fragment (if any) before remote senders start;
//! - dispatch all instances of each fragment in parallel, left to right over
//!   fragments so receivers exist before senders emit;
//! - aggregate status reports, profiles, and insert state from backends;
//! - fan out best-effort cancellation on failure or caller request;
//! - finalize bulk-insert queries on the filesystem after all reports landed.
//!
//! Locking protocol:
//! - the query lock guards query status, the remaining-backend count, and the
//!   insert bookkeeping maps; it is deliberately held across dispatch so an
//!   async cancel waits until every instance exists;
//! - each instance has its own lock; the query lock is always acquired before
//!   an instance lock, never the reverse;
//! - `update_fragment_exec_status` finishes its instance-local work and
//!   releases the instance lock before touching query-wide state.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, RwLock as StdRwLock};

use arrow::record_batch::RecordBatch;
use futures::future::join_all;
use kite_common::config::CoordinatorSettings;
use kite_common::error::{KiteError, Result};
use kite_common::ids::{PlanNodeId, UniqueId};
use kite_common::metrics::{global_metrics, MetricsRegistry};
use kite_common::status::ExecStatus;
use kite_plan::{PlanNodeType, QueryExecRequest, QueryOptions};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use crate::backend_state::BackendExecState;
use crate::client::ClientCache;
use crate::executor::{FragmentExecutor, FragmentExecutorFactory};
use crate::finalize::{finalize_insert, DistributedFs};
use crate::profile::{
    collect_scan_node_counters, pretty_bytes, CounterUnit, FragmentInstanceCounters,
    RuntimeProfile, SummaryStats,
};
use crate::progress::{ExecStats, ProgressUpdater, QueryType};
use crate::schedule::{
    build_exec_fragment_request, compute_query_schedule, ClusterScheduler, QuerySchedule,
};
use crate::wire::{CatalogUpdate, ReportExecStatusRequest};

/// Profile bookkeeping for one fragment of the query.
struct PerFragmentProfile {
    num_instances: usize,
    /// Averaged over instances during the query summary. For a local root
    /// fragment this is the executor's own profile.
    averaged_profile: RuntimeProfile,
    /// Parent of the per-instance profiles.
    root_profile: RuntimeProfile,
    bytes_assigned: SummaryStats,
    completion_times: SummaryStats,
    rates: SummaryStats,
}

/// Query-wide mutable state, guarded by the query lock.
#[derive(Default)]
struct QueryShared {
    query_status: ExecStatus,
    num_remaining_backends: usize,
    /// Tmp path -> final path, merged from table-sink reports.
    files_to_move: BTreeMap<String, String>,
    /// Rows appended per partition key, merged from table-sink reports.
    partition_row_counts: HashMap<String, i64>,
}

/// Per-query state installed by `exec` and immutable afterwards.
struct QueryExecContext {
    query_id: UniqueId,
    finalize_params: Option<kite_plan::FinalizeParams>,
    root_instance_id: Option<UniqueId>,
    scan_node_ids: Vec<PlanNodeId>,
    query_profile: RuntimeProfile,
    aggregate_profile: RuntimeProfile,
    fragment_profiles: StdMutex<Vec<PerFragmentProfile>>,
    progress: ProgressUpdater,
    executor: Option<Arc<dyn FragmentExecutor>>,
    coordinator_counters: FragmentInstanceCounters,
    exec_stats: ExecStats,
}

/// Control plane of one query: owns dispatch, aggregation, cancellation, and
/// finalization. One coordinator serves exactly one `exec` call.
pub struct Coordinator {
    settings: CoordinatorSettings,
    metrics: MetricsRegistry,
    clients: ClientCache,
    scheduler: Arc<dyn ClusterScheduler>,
    executor_factory: Arc<dyn FragmentExecutorFactory>,
    fs: Arc<dyn DistributedFs>,

    exec_ctx: OnceLock<QueryExecContext>,
    shared: Mutex<QueryShared>,
    /// Appended under the query lock during dispatch; indexed by backend_num.
    backend_states: StdRwLock<Vec<Arc<BackendExecState>>>,
    /// Signalled when the last backend reports, or on cancellation.
    backend_completion: Notify,
    /// Serializes `wait`; the bool is has_called_wait.
    wait_lock: Mutex<bool>,
    has_called_wait: AtomicBool,
    summary_reported: AtomicBool,
}

impl Coordinator {
    /// Builds a coordinator over its external collaborators.
    pub fn new(
        settings: CoordinatorSettings,
        scheduler: Arc<dyn ClusterScheduler>,
        executor_factory: Arc<dyn FragmentExecutorFactory>,
        clients: ClientCache,
        fs: Arc<dyn DistributedFs>,
    ) -> Self {
        Self {
            settings,
            metrics: global_metrics().clone(),
            clients,
            scheduler,
            executor_factory,
            fs,
            exec_ctx: OnceLock::new(),
            shared: Mutex::new(QueryShared::default()),
            backend_states: StdRwLock::new(Vec::new()),
            backend_completion: Notify::new(),
            wait_lock: Mutex::new(false),
            has_called_wait: AtomicBool::new(false),
            summary_reported: AtomicBool::new(false),
        }
    }

    /// Replaces the process-wide metrics registry with an injected one.
    pub fn with_metrics(mut self, metrics: MetricsRegistry) -> Self {
        self.metrics = metrics;
        self
    }

    fn exec_ctx(&self) -> Result<&QueryExecContext> {
        self.exec_ctx
            .get()
            .ok_or_else(|| KiteError::Internal("coordinator used before exec".to_string()))
    }

    fn backend_state(&self, backend_num: usize) -> Result<Arc<BackendExecState>> {
        self.backend_states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(backend_num)
            .cloned()
            .ok_or_else(|| KiteError::Internal(format!("unknown backend number {backend_num}")))
    }

    fn backend_states_snapshot(&self) -> Vec<Arc<BackendExecState>> {
        self.backend_states
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Assigns execution sites and synchronously dispatches every fragment
    /// instance. Returns the first dispatch error, in which case the query
    /// has already been cancelled.
    pub async fn exec(
        &self,
        query_id: UniqueId,
        request: &QueryExecRequest,
        options: &QueryOptions,
    ) -> Result<()> {
        if request.fragments.is_empty() {
            return Err(KiteError::Planning("query has no fragments".to_string()));
        }
        info!(
            query_id = %query_id,
            fragments = request.fragments.len(),
            operator = "CoordinatorExec",
            "executing query"
        );

        let coord = self.settings.coordinator_endpoint();
        let schedule =
            match compute_query_schedule(query_id, request, self.scheduler.as_ref(), &coord) {
                Ok(schedule) => schedule,
                Err(err) => {
                    let status = ExecStatus::from(&err);
                    self.shared.lock().await.query_status.update(&status);
                    return Err(err);
                }
            };

        // Holding the query lock across dispatch makes an async cancel wait
        // until every instance has been created; otherwise cancel could race
        // ahead of construction and miss instances.
        let mut shared = self.shared.lock().await;

        let has_coordinator_fragment = !request.fragments[0].partition.is_partitioned();
        let executor = if has_coordinator_fragment {
            let executor = self.executor_factory.create();
            // Prepare the local root before any remote fragment starts:
            // its exchange nodes must be registered with the stream manager
            // before remote senders emit rows.
            let rpc_params = build_exec_fragment_request(
                query_id,
                request,
                0,
                &schedule.fragment_exec_params[0],
                0,
                &schedule.scan_range_assignment[0],
                &coord,
                0,
                options,
            );
            executor.prepare(rpc_params).await?;
            Some(executor)
        } else {
            None
        };

        let ctx = self.build_exec_context(query_id, request, &schedule, executor);
        self.exec_ctx
            .set(ctx)
            .map_err(|_| KiteError::Internal("exec called twice".to_string()))?;
        let ctx = self.exec_ctx()?;

        shared.num_remaining_backends = schedule.num_backends;
        self.metrics
            .set_remaining_backends(&query_id.to_string(), schedule.num_backends as u64);
        self.metrics
            .add_scan_ranges_assigned(&query_id.to_string(), schedule.num_scan_ranges as u64);
        info!(
            query_id = %query_id,
            backends = schedule.num_backends,
            scan_ranges = schedule.num_scan_ranges,
            operator = "CoordinatorExec",
            "starting remote backends"
        );

        // Start fragments left to right so receivers have prepared before
        // senders start sending; within one fragment all instances dispatch
        // in parallel.
        let first_remote = usize::from(has_coordinator_fragment);
        let mut backend_num = 0usize;
        for fragment_idx in first_remote..request.fragments.len() {
            let params = &schedule.fragment_exec_params[fragment_idx];
            let mut states = Vec::with_capacity(params.hosts.len());
            for instance_idx in 0..params.hosts.len() {
                let rpc_params = build_exec_fragment_request(
                    query_id,
                    request,
                    fragment_idx,
                    params,
                    instance_idx,
                    &schedule.scan_range_assignment[fragment_idx],
                    &coord,
                    backend_num,
                    options,
                );
                let state = Arc::new(BackendExecState::new(
                    backend_num,
                    fragment_idx,
                    params.hosts[instance_idx].clone(),
                    rpc_params,
                ));
                debug!(
                    query_id = %query_id,
                    fragment_idx,
                    instance_id = %state.instance_id,
                    host = %state.host,
                    operator = "CoordinatorExec",
                    "starting fragment instance"
                );
                self.backend_states
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(Arc::clone(&state));
                states.push(state);
                backend_num += 1;
            }
            ctx.fragment_profiles
                .lock()
                .unwrap_or_else(|e| e.into_inner())[fragment_idx]
                .num_instances = params.hosts.len();

            let results = join_all(
                states
                    .iter()
                    .map(|state| self.exec_remote_fragment(state)),
            )
            .await;
            if let Some(err) = results.into_iter().find_map(|result| result.err()) {
                // Nobody can have cancelled yet; the query lock is held.
                debug_assert!(shared.query_status.is_ok());
                // The caller gets the dispatch error; the query itself is
                // torn down as cancelled, with the cause attached.
                let mut status = ExecStatus::cancelled();
                status.add_error_msg(err.to_string());
                shared.query_status.update(&status);
                self.cancel_internal(&mut shared).await;
                return Err(err);
            }
        }

        self.metrics
            .add_backends_dispatched(&query_id.to_string(), backend_num as u64);
        self.log_split_size_summary(ctx);
        Ok(())
    }

    fn build_exec_context(
        &self,
        query_id: UniqueId,
        request: &QueryExecRequest,
        schedule: &QuerySchedule,
        executor: Option<Arc<dyn FragmentExecutor>>,
    ) -> QueryExecContext {
        let query_profile = RuntimeProfile::new(format!("Query {query_id}"));
        let aggregate_profile = RuntimeProfile::new("Aggregate Profile");

        // Profile order: coordinator fragment first, then the aggregate
        // profile, then per-fragment profiles in fragment order.
        let mut coordinator_counters = FragmentInstanceCounters::default();
        if let Some(executor) = &executor {
            let executor_profile = executor.profile();
            executor_profile.set_name("Coordinator Fragment");
            query_profile.add_child(executor_profile.clone());
            collect_scan_node_counters(&executor_profile, &mut coordinator_counters);
        }
        query_profile.add_child(aggregate_profile.clone());

        let mut fragment_profiles = Vec::with_capacity(request.fragments.len());
        for idx in 0..request.fragments.len() {
            if idx == 0 {
                if let Some(executor) = &executor {
                    // Single local instance; the average is just the
                    // coordinator profile itself.
                    fragment_profiles.push(PerFragmentProfile {
                        num_instances: 1,
                        averaged_profile: executor.profile(),
                        root_profile: RuntimeProfile::new("Fragment 0"),
                        bytes_assigned: SummaryStats::default(),
                        completion_times: SummaryStats::default(),
                        rates: SummaryStats::default(),
                    });
                    continue;
                }
            }
            let averaged_profile = RuntimeProfile::new(format!("Averaged Fragment {idx}"));
            let root_profile = RuntimeProfile::new(format!("Fragment {idx}"));
            query_profile.add_child(averaged_profile.clone());
            query_profile.add_child(root_profile.clone());
            fragment_profiles.push(PerFragmentProfile {
                num_instances: 0,
                averaged_profile,
                root_profile,
                bytes_assigned: SummaryStats::default(),
                completion_times: SummaryStats::default(),
                rates: SummaryStats::default(),
            });
        }

        let scan_node_ids: Vec<PlanNodeId> = request
            .fragments
            .iter()
            .flat_map(|fragment| fragment.plan.nodes.iter())
            .filter(|node| node.node_type == PlanNodeType::Scan)
            .map(|node| node.node_id)
            .collect();

        let query_type = if request.finalize_params.is_some() {
            QueryType::Insert
        } else {
            QueryType::Select
        };

        QueryExecContext {
            query_id,
            finalize_params: request.finalize_params.clone(),
            root_instance_id: executor
                .as_ref()
                .and_then(|_| schedule.fragment_exec_params[0].instance_ids.first().copied()),
            scan_node_ids,
            query_profile,
            aggregate_profile,
            fragment_profiles: StdMutex::new(fragment_profiles),
            progress: ProgressUpdater::new(
                format!("Query {query_id}"),
                schedule.num_scan_ranges as i64,
                self.settings.progress_log_stride_percent,
            ),
            executor,
            coordinator_counters,
            exec_stats: ExecStats::new(query_type),
        }
    }

    /// Sends the exec RPC of one instance, with one reopen-retry on
    /// transport failure. The instance lock is held across the RPC.
    async fn exec_remote_fragment(&self, state: &BackendExecState) -> Result<()> {
        let ctx = self.exec_ctx()?;
        debug!(
            query_id = %ctx.query_id,
            instance_id = %state.instance_id,
            host = %state.host,
            operator = "CoordinatorExec",
            "sending ExecPlanFragment rpc"
        );
        let mut exec = state.exec.lock().await;
        let mut client = self.clients.client(&state.host).await?;

        let result = match client.exec_plan_fragment(&state.rpc_params).await {
            Err(KiteError::Transport(first)) => {
                // A backend that restarted leaves a stale pooled connection
                // behind; reopen once and retry before giving up.
                debug!(
                    instance_id = %state.instance_id,
                    error = %first,
                    operator = "CoordinatorExec",
                    "retrying ExecPlanFragment after transport failure"
                );
                self.metrics.inc_rpc_retries("ExecPlanFragment");
                match client.reopen().await {
                    Ok(()) => client.exec_plan_fragment(&state.rpc_params).await,
                    Err(reopen_err) => Err(reopen_err),
                }
            }
            other => other,
        };

        match result {
            Ok(status) => {
                exec.status = status;
                if exec.status.is_ok() {
                    exec.initiated = true;
                    state.stopwatch.start();
                    Ok(())
                } else {
                    Err(KiteError::Execution(format!(
                        "ExecPlanFragment to {} failed: {}",
                        state.host,
                        exec.status.message()
                    )))
                }
            }
            Err(err) => {
                exec.status = ExecStatus::from(&err);
                Err(err)
            }
        }
    }

    /// Consumes a periodic status report from a remote instance.
    pub async fn update_fragment_exec_status(
        &self,
        params: ReportExecStatusRequest,
    ) -> Result<()> {
        let ctx = self.exec_ctx()?;
        debug!(
            query_id = %ctx.query_id,
            backend_num = params.backend_num,
            done = params.done,
            operator = "CoordinatorUpdateStatus",
            "fragment exec status report"
        );
        let state = self.backend_state(params.backend_num)?;
        let report_status = params.status.clone();

        {
            let mut exec = state.exec.lock().await;
            if !exec.status.is_ok() && report_status.is_ok() {
                // An instance never goes back from error to OK; a stale OK
                // report can trail our own cancellation marker.
                warn!(
                    query_id = %ctx.query_id,
                    instance_id = %state.instance_id,
                    operator = "CoordinatorUpdateStatus",
                    "ignoring report transitioning instance from error to OK"
                );
            } else {
                exec.status = report_status.clone();
            }
            exec.done = params.done;
            state.profile.update(&params.profile);
            if !exec.profile_created {
                collect_scan_node_counters(&state.profile, &mut exec.aggregate_counters);
            }
            exec.profile_created = true;

            if !params.error_log.is_empty() {
                exec.error_log.extend(params.error_log.iter().cloned());
                debug!(
                    instance_id = %state.instance_id,
                    errors = params.error_log.len(),
                    operator = "CoordinatorUpdateStatus",
                    "appended backend error log"
                );
            }
            let delta = exec.update_ranges_completed();
            ctx.progress.update(delta);
        }
        // Instance-local work done; query-wide state is touched only after
        // the instance lock is released.

        if params.done {
            if let Some(insert_status) = &params.insert_exec_status {
                let mut shared = self.shared.lock().await;
                for (partition, rows) in &insert_status.num_appended_rows {
                    *shared
                        .partition_row_counts
                        .entry(partition.clone())
                        .or_insert(0) += rows;
                }
                shared
                    .files_to_move
                    .extend(insert_status.files_to_move.clone());
            }
        }

        if !report_status.is_ok() {
            self.update_status(&report_status, Some(state.instance_id))
                .await;
            return Ok(());
        }

        if params.done {
            let mut shared = self.shared.lock().await;
            state.stopwatch.stop();
            debug_assert!(shared.num_remaining_backends > 0);
            shared.num_remaining_backends = shared.num_remaining_backends.saturating_sub(1);
            self.metrics.set_remaining_backends(
                &ctx.query_id.to_string(),
                shared.num_remaining_backends as u64,
            );
            debug!(
                query_id = %ctx.query_id,
                backend_num = params.backend_num,
                remaining = shared.num_remaining_backends,
                operator = "CoordinatorUpdateStatus",
                "backend completed"
            );
            if shared.num_remaining_backends == 0 {
                self.backend_completion.notify_waiters();
            }
        }
        Ok(())
    }

    /// Promotes the query status to `status` if still OK, initiating
    /// cancellation; later errors only log. Returns the query status.
    async fn update_status(
        &self,
        status: &ExecStatus,
        failed_instance: Option<UniqueId>,
    ) -> ExecStatus {
        let current = {
            let mut shared = self.shared.lock().await;
            if status.is_ok() || !shared.query_status.is_ok() {
                shared.query_status.clone()
            } else {
                shared.query_status = status.clone();
                self.cancel_internal(&mut shared).await;
                shared.query_status.clone()
            }
        };
        if let (Some(instance_id), false) = (failed_instance, status.is_ok()) {
            if let Some(ctx) = self.exec_ctx.get() {
                warn!(
                    query_id = %ctx.query_id,
                    instance_id = %instance_id,
                    status = %status,
                    operator = "CoordinatorUpdateStatus",
                    "query failed because a fragment instance failed"
                );
            }
        }
        current
    }

    /// Blocks until all remote backends finished or the query left OK.
    async fn wait_for_all_backends(&self) -> ExecStatus {
        let notified = self.backend_completion.notified();
        tokio::pin!(notified);
        loop {
            notified.as_mut().enable();
            {
                let shared = self.shared.lock().await;
                if shared.num_remaining_backends == 0 || !shared.query_status.is_ok() {
                    debug!(
                        remaining = shared.num_remaining_backends,
                        operator = "CoordinatorWait",
                        "all backends finished or error"
                    );
                    return shared.query_status.clone();
                }
                debug!(
                    remaining = shared.num_remaining_backends,
                    operator = "CoordinatorWait",
                    "waiting for backends to finish"
                );
            }
            notified.as_mut().await;
            notified.set(self.backend_completion.notified());
        }
    }

    /// Idempotent: the first call blocks until all remote backends finished
    /// and, for bulk inserts, runs finalization. Later calls return OK.
    pub async fn wait(&self) -> Result<()> {
        let mut wait_guard = self.wait_lock.lock().await;
        if *wait_guard {
            return Ok(());
        }
        *wait_guard = true;
        self.has_called_wait.store(true, Ordering::Release);
        let ctx = self.exec_ctx()?;

        if let Some(executor) = &ctx.executor {
            let open_status = match executor.open().await {
                Ok(()) => ExecStatus::ok(),
                Err(err) => ExecStatus::from(&err),
            };
            self.update_status(&open_status, ctx.root_instance_id)
                .await
                .to_result()?;

            // The coordinator fragment owns the only table sink when it
            // exists, so the sink state can be copied rather than merged.
            let mut shared = self.shared.lock().await;
            debug_assert!(shared.files_to_move.is_empty());
            debug_assert!(shared.partition_row_counts.is_empty());
            shared.files_to_move = executor.files_to_move();
            shared.partition_row_counts = executor.num_appended_rows();
        } else {
            // Finalization needs every backend's sink state in hand, which
            // only matters for parallel inserts; with a coordinator fragment
            // the state is complete once open() returns.
            self.wait_for_all_backends().await.to_result()?;
        }

        if ctx.finalize_params.is_some() {
            self.finalize_query().await?;
        }
        Ok(())
    }

    /// Filesystem commit for bulk inserts; post-condition of [`Coordinator::wait`].
    async fn finalize_query(&self) -> Result<()> {
        let ctx = self.exec_ctx()?;
        debug_assert!(self.has_called_wait.load(Ordering::Acquire));
        let params = ctx
            .finalize_params
            .as_ref()
            .ok_or_else(|| KiteError::Internal("finalize without finalize params".to_string()))?;
        let (partition_row_counts, files_to_move) = {
            let shared = self.shared.lock().await;
            (
                shared.partition_row_counts.clone(),
                shared.files_to_move.clone(),
            )
        };
        finalize_insert(self.fs.as_ref(), params, &partition_row_counts, &files_to_move)
    }

    /// Pulls one result batch from the local root fragment; `None` after the
    /// final batch, at which point all backends have reported.
    pub async fn get_next(&self) -> Result<Option<RecordBatch>> {
        let ctx = self.exec_ctx()?;
        debug_assert!(self.has_called_wait.load(Ordering::Acquire));

        let Some(executor) = &ctx.executor else {
            // Without a local fragment there is no output, and execution
            // finished inside wait().
            self.get_status().await.to_result()?;
            return Ok(None);
        };

        // The query lock stays free here so an async cancel can proceed
        // while the caller sits in the executor's pull.
        let (batch, fetch_status) = match executor.get_next().await {
            Ok(batch) => (batch, ExecStatus::ok()),
            Err(err) => (None, ExecStatus::from(&err)),
        };
        // Surface the query-wide status, not the executor's own, which may
        // merely be CANCELLED as a side effect of teardown.
        self.update_status(&fetch_status, ctx.root_instance_id)
            .await
            .to_result()?;

        match batch {
            Some(batch) => {
                ctx.exec_stats.add_rows(batch.num_rows() as i64);
                Ok(Some(batch))
            }
            None => {
                // Hold the final None until every backend reported; callers
                // may tear down query state right after, and finalization
                // depends on the full set of reports.
                let status = self.wait_for_all_backends().await;
                status.to_result()?;
                self.report_query_summary(&status).await;
                Ok(None)
            }
        }
    }

    /// Idempotent cancellation: promotes the status to CANCELLED if still OK
    /// and fans out cancel RPCs to initiated, unfinished instances.
    pub async fn cancel(&self) {
        let mut shared = self.shared.lock().await;
        if !shared.query_status.is_ok() {
            // Cancellation has already been initiated elsewhere.
            return;
        }
        shared.query_status = ExecStatus::cancelled();
        self.cancel_internal(&mut shared).await;
    }

    /// Cancel fan-out; the caller holds the query lock and has already set a
    /// non-OK query status.
    async fn cancel_internal(&self, shared: &mut QueryShared) {
        debug_assert!(!shared.query_status.is_ok());
        let Some(ctx) = self.exec_ctx.get() else {
            return;
        };
        info!(
            query_id = %ctx.query_id,
            status = %shared.query_status,
            operator = "CoordinatorCancel",
            "cancelling query"
        );

        if let Some(executor) = &ctx.executor {
            executor.cancel();
        }

        for state in self.backend_states_snapshot() {
            // Lock instances individually; reports for other instances keep
            // flowing while this fan-out runs.
            let mut exec = state.exec.lock().await;
            // Already terminated with an error or cancelled before: nothing
            // further may be sent.
            if !exec.status.is_ok() {
                continue;
            }
            // Marking CANCELLED here guarantees at most one cancel RPC.
            exec.status = ExecStatus::cancelled();
            if !exec.initiated {
                // The exec RPC was never sent.
                continue;
            }
            if exec.done {
                continue;
            }

            debug!(
                query_id = %ctx.query_id,
                instance_id = %state.instance_id,
                host = %state.host,
                operator = "CoordinatorCancel",
                "sending CancelPlanFragment rpc"
            );
            let mut client = match self.clients.client(&state.host).await {
                Ok(client) => client,
                Err(err) => {
                    exec.status
                        .add_error_msg(format!("cancel connect to {} failed: {err}", state.host));
                    continue;
                }
            };
            let result = match client.cancel_plan_fragment(state.instance_id).await {
                Err(KiteError::Transport(first)) => {
                    debug!(
                        instance_id = %state.instance_id,
                        error = %first,
                        operator = "CoordinatorCancel",
                        "retrying CancelPlanFragment after transport failure"
                    );
                    self.metrics.inc_rpc_retries("CancelPlanFragment");
                    match client.reopen().await {
                        Ok(()) => client.cancel_plan_fragment(state.instance_id).await,
                        Err(reopen_err) => Err(reopen_err),
                    }
                }
                other => other,
            };
            self.metrics.inc_cancel_rpcs(&ctx.query_id.to_string());
            match result {
                Ok(status) if !status.is_ok() => {
                    exec.status.add_error_msg(status.message());
                }
                Ok(_) => {}
                Err(err) => {
                    // Note the failure on the instance, keep cancelling the
                    // other fragments.
                    exec.status.add_error_msg(format!(
                        "CancelPlanFragment to {} failed: {err}",
                        state.host
                    ));
                }
            }
        }

        // Release any thread waiting for backend completion.
        self.backend_completion.notify_waiters();

        // Report the summary with whatever progress the query made.
        let final_status = shared.query_status.clone();
        self.report_query_summary(&final_status).await;
    }

    /// Query-wide status, read under the query lock.
    pub async fn get_status(&self) -> ExecStatus {
        self.shared.lock().await.query_status.clone()
    }

    /// After completion, fills the set of partitions created; true iff
    /// non-empty.
    pub async fn prepare_catalog_update(&self, update: &mut CatalogUpdate) -> Result<bool> {
        let ctx = self.exec_ctx()?;
        debug_assert!(self.has_called_wait.load(Ordering::Acquire));
        if let Some(params) = &ctx.finalize_params {
            update.target_table = params.table_name.clone();
        }
        let shared = self.shared.lock().await;
        for partition in shared.partition_row_counts.keys() {
            update.created_partitions.insert(partition.clone());
        }
        Ok(!update.created_partitions.is_empty())
    }

    /// Concatenates the local executor's error lines and every backend's,
    /// each backend prefixed by its index.
    pub async fn error_log(&self) -> String {
        let mut out = String::new();
        let _shared = self.shared.lock().await;
        if let Some(ctx) = self.exec_ctx.get() {
            if let Some(executor) = &ctx.executor {
                let lines = executor.error_log();
                if !lines.is_empty() {
                    out.push_str(&lines.join("\n"));
                    out.push('\n');
                }
            }
        }
        for (idx, state) in self.backend_states_snapshot().iter().enumerate() {
            let exec = state.exec.lock().await;
            if !exec.error_log.is_empty() {
                out.push_str(&format!("Backend {idx}:"));
                out.push_str(&exec.error_log.join("\n"));
                out.push('\n');
            }
        }
        out
    }

    /// Rows-returned and query-type summary stats.
    pub fn exec_stats(&self) -> Result<&ExecStats> {
        Ok(&self.exec_ctx()?.exec_stats)
    }

    /// Scan-range progress across all instances.
    pub fn progress(&self) -> Result<&ProgressUpdater> {
        Ok(&self.exec_ctx()?.progress)
    }

    /// The query-wide runtime profile tree.
    pub fn query_profile(&self) -> Result<RuntimeProfile> {
        Ok(self.exec_ctx()?.query_profile.clone())
    }

    /// Attaches split-size summary stats to every fragment profile after
    /// dispatch.
    fn log_split_size_summary(&self, ctx: &QueryExecContext) {
        let states = self.backend_states_snapshot();
        let mut profiles = ctx
            .fragment_profiles
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        for state in &states {
            profiles[state.fragment_idx]
                .bytes_assigned
                .add(state.total_split_size as f64);
        }
        let skip = usize::from(ctx.executor.is_some());
        for (idx, data) in profiles.iter().enumerate().skip(skip) {
            let stats = &data.bytes_assigned;
            if stats.count() == 0 {
                continue;
            }
            let label = format!(
                "min: {}, max: {}, avg: {}, stddev: {}",
                pretty_bytes(stats.min()),
                pretty_bytes(stats.max()),
                pretty_bytes(stats.mean()),
                pretty_bytes(stats.stddev())
            );
            debug!(
                fragment_idx = idx,
                split_sizes = %label,
                operator = "CoordinatorExec",
                "byte split for fragment"
            );
            data.averaged_profile.add_info_string("split sizes", label);
        }
    }

    /// Appends summary information to the query profile: averaged instance
    /// profiles per fragment, completion-time and rate spreads, and
    /// aggregate scan-node totals. Runs at most once, when results are
    /// drained or on cancellation.
    async fn report_query_summary(&self, final_status: &ExecStatus) {
        // Before wait, the query made so little progress that a summary is
        // not useful and much of the state below is uninitialized.
        if !self.has_called_wait.load(Ordering::Acquire) {
            return;
        }
        let Some(ctx) = self.exec_ctx.get() else {
            return;
        };
        if self.summary_reported.swap(true, Ordering::AcqRel) {
            return;
        }

        let states = self.backend_states_snapshot();
        {
            let mut profiles = ctx
                .fragment_profiles
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            for state in &states {
                let data = &mut profiles[state.fragment_idx];
                let completion_ms = state.stopwatch.elapsed_ms() as f64;
                data.completion_times.add(completion_ms);
                let rate = if completion_ms > 0.0 {
                    state.total_split_size as f64 / (completion_ms / 1000.0)
                } else {
                    0.0
                };
                data.rates.add(rate);
                data.averaged_profile.merge(&state.profile);
                data.root_profile.add_child(state.profile.clone());
            }

            let skip = usize::from(ctx.executor.is_some());
            for data in profiles.iter_mut().skip(skip) {
                data.averaged_profile.divide(data.num_instances);
                let times = &data.completion_times;
                data.averaged_profile.add_info_string(
                    "completion times",
                    format!(
                        "min: {:.0}ms, max: {:.0}ms, mean: {:.0}ms, stddev: {:.0}ms",
                        times.min(),
                        times.max(),
                        times.mean(),
                        times.stddev()
                    ),
                );
                let rates = &data.rates;
                data.averaged_profile.add_info_string(
                    "execution rates",
                    format!(
                        "min: {}/s, max: {}/s, mean: {}/s, stddev: {}/s",
                        pretty_bytes(rates.min()),
                        pretty_bytes(rates.max()),
                        pretty_bytes(rates.mean()),
                        pretty_bytes(rates.stddev())
                    ),
                );
            }
        }

        // Aggregate per-scan-node totals across the local fragment and all
        // backends.
        for node_id in &ctx.scan_node_ids {
            let mut throughput = 0_i64;
            let mut ranges_complete = 0_i64;
            for state in &states {
                throughput += state.node_throughput(*node_id).await;
                ranges_complete += state.ranges_completed(*node_id).await;
            }
            if let Some(counter) = ctx.coordinator_counters.throughput.get(node_id) {
                throughput += counter.value();
            }
            if let Some(counter) = ctx.coordinator_counters.scan_ranges_complete.get(node_id) {
                ranges_complete += counter.value();
            }
            ctx.aggregate_profile
                .add_counter(
                    &format!("Scan (id={node_id}) Throughput"),
                    CounterUnit::BytesPerSecond,
                )
                .set(throughput);
            ctx.aggregate_profile
                .add_counter(
                    &format!("Scan (id={node_id}) Completed scan ranges"),
                    CounterUnit::Unit,
                )
                .set(ranges_complete);
        }

        let result_label = if final_status.is_ok() {
            "ok"
        } else if final_status.is_cancelled() {
            "cancelled"
        } else {
            "error"
        };
        self.metrics.inc_queries_executed(result_label);
        debug!(
            query_id = %ctx.query_id,
            rows = ctx.exec_stats.num_rows(),
            operator = "CoordinatorSummary",
            profile = %ctx.query_profile.pretty(),
            "final query profile"
        );
    }
}
