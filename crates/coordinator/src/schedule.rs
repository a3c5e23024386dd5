//! Execution-host planning and scan-range assignment.
//!
//! Responsibilities:
//! - decide the execution host set of every fragment (producers before
//!   consumers, so consumers may inherit their input's hosts);
//! - allocate globally unique instance ids;
//! - compute sender counts and destination lists for every exchange edge;
//! - distribute scan ranges across execution hosts with a min-assigned-bytes
//!   heuristic;
//! - build the per-instance dispatch payload.

use std::collections::HashMap;

use kite_common::error::{KiteError, Result};
use kite_common::ids::{HostPort, PlanNodeId, UniqueId};
use kite_plan::{
    PlanNodeType, QueryExecRequest, QueryOptions, ScanRangeLocations, ScanRangeParams,
};
use tracing::debug;

use crate::wire::{ExecFragmentRequest, FragmentDestination};

/// Seam to the cluster scheduler that maps data hosts to execution hosts.
pub trait ClusterScheduler: Send + Sync {
    /// Maps each data host to an execution host, preserving order and length.
    fn get_hosts(&self, data_hosts: &[HostPort]) -> Result<Vec<HostPort>>;
}

/// Scheduler for clusters where every data host runs a backend: scans
/// execute on the host storing the data.
#[derive(Debug, Default)]
pub struct ColocatedScheduler;

impl ClusterScheduler for ColocatedScheduler {
    fn get_hosts(&self, data_hosts: &[HostPort]) -> Result<Vec<HostPort>> {
        Ok(data_hosts.to_vec())
    }
}

/// Computed execution parameters of one fragment.
#[derive(Debug, Clone, Default)]
pub struct FragmentExecParams {
    /// Execution hosts, one instance each.
    pub hosts: Vec<HostPort>,
    /// Instance ids, parallel to `hosts`.
    pub instance_ids: Vec<UniqueId>,
    /// Sender count per exchange node in this fragment.
    pub per_exch_num_senders: HashMap<PlanNodeId, usize>,
    /// Receivers of this fragment's stream sink.
    pub destinations: Vec<FragmentDestination>,
    /// Data host -> execution host, as returned by the cluster scheduler.
    pub data_server_map: HashMap<HostPort, HostPort>,
}

/// Scan ranges of one execution host, keyed by scan node.
pub type PerNodeScanRanges = HashMap<PlanNodeId, Vec<ScanRangeParams>>;

/// Scan-range assignment of one fragment, keyed by execution host.
pub type FragmentScanRangeAssignment = HashMap<HostPort, PerNodeScanRanges>;

/// Everything the dispatcher needs, computed up front from the request.
#[derive(Debug, Default)]
pub struct QuerySchedule {
    /// Per-fragment execution parameters, parallel to `request.fragments`.
    pub fragment_exec_params: Vec<FragmentExecParams>,
    /// Per-fragment scan-range assignment, parallel to `request.fragments`.
    pub scan_range_assignment: Vec<FragmentScanRangeAssignment>,
    /// Remote instances the coordinator will dispatch (excludes a local root).
    pub num_backends: usize,
    /// Total scan ranges across all nodes, for progress tracking.
    pub num_scan_ranges: usize,
}

/// Plans hosts, instance ids, exchange edges, and scan-range assignment.
pub fn compute_query_schedule(
    query_id: UniqueId,
    request: &QueryExecRequest,
    scheduler: &dyn ClusterScheduler,
    coord: &HostPort,
) -> Result<QuerySchedule> {
    let mut schedule = QuerySchedule {
        fragment_exec_params: vec![FragmentExecParams::default(); request.fragments.len()],
        ..QuerySchedule::default()
    };
    compute_fragment_hosts(request, scheduler, coord, &mut schedule.fragment_exec_params)?;
    assign_instance_ids(query_id, request, &mut schedule)?;
    compute_exchange_edges(request, &mut schedule.fragment_exec_params)?;
    compute_scan_range_assignment(request, &mut schedule)?;
    Ok(schedule)
}

/// Decides the execution host set of every fragment.
///
/// Fragments are visited in reverse index order so a fragment's producers are
/// planned before it; a fragment without its own scan inherits the host set
/// of its leftmost input fragment.
fn compute_fragment_hosts(
    request: &QueryExecRequest,
    scheduler: &dyn ClusterScheduler,
    coord: &HostPort,
    params: &mut [FragmentExecParams],
) -> Result<()> {
    let scan_types = [PlanNodeType::Scan];

    for idx in (0..request.fragments.len()).rev() {
        let fragment = &request.fragments[idx];
        if !fragment.partition.is_partitioned() {
            // All single-instance fragments run on the coordinator host.
            params[idx].hosts.push(coord.clone());
            continue;
        }

        let leftmost_scan = fragment.plan.find_leftmost_of_types(&scan_types);
        if !leftmost_scan.is_valid() {
            // No scan of our own; run where the leftmost input's rows are
            // produced so the exchange stays local.
            let input_idx = request.find_leftmost_input_fragment(idx).ok_or_else(|| {
                KiteError::Planning(format!(
                    "fragment {idx} has neither a scan nor an input fragment"
                ))
            })?;
            params[idx].hosts = params[input_idx].hosts.clone();
            // TODO: switch to unpartitioned/coordinator execution if the
            // input fragment was itself downgraded to a single host.
            continue;
        }

        let locations = request
            .per_node_scan_ranges
            .get(&leftmost_scan)
            .filter(|locations| !locations.is_empty());
        let Some(locations) = locations else {
            // Scan without ranges; run it on the coordinator.
            // TODO: revisit once joins can be partitioned, a right outer
            // join with a large build side should not land here.
            params[idx].hosts.push(coord.clone());
            continue;
        };

        // Distinct data hosts, first-appearance order.
        let mut data_hosts: Vec<HostPort> = Vec::new();
        for location in locations.iter().flat_map(|l| l.locations.iter()) {
            if !data_hosts.contains(&location.server) {
                data_hosts.push(location.server.clone());
            }
        }

        let exec_hosts = scheduler.get_hosts(&data_hosts)?;
        if exec_hosts.len() != data_hosts.len() {
            return Err(KiteError::Planning(format!(
                "cluster scheduler returned {} execution hosts for {} data hosts",
                exec_hosts.len(),
                data_hosts.len()
            )));
        }
        for (data_host, exec_host) in data_hosts.iter().zip(exec_hosts.iter()) {
            params[idx]
                .data_server_map
                .insert(data_host.clone(), exec_host.clone());
        }

        let mut hosts = exec_hosts;
        hosts.sort();
        hosts.dedup();
        params[idx].hosts = hosts;
    }
    Ok(())
}

/// Allocates globally unique instance ids for every fragment instance.
fn assign_instance_ids(
    query_id: UniqueId,
    request: &QueryExecRequest,
    schedule: &mut QuerySchedule,
) -> Result<()> {
    let mut num_backends = 0usize;
    for params in &mut schedule.fragment_exec_params {
        for offset in 0..params.hosts.len() {
            let instance_num = (num_backends + offset) as i64;
            let lo = query_id
                .lo
                .checked_add(instance_num + 1)
                .ok_or_else(|| {
                    KiteError::Planning(format!(
                        "instance-id space exhausted for query {query_id}"
                    ))
                })?;
            params.instance_ids.push(UniqueId::new(query_id.hi, lo));
        }
        num_backends += params.hosts.len();
    }
    if !request.fragments[0].partition.is_partitioned() {
        // The root runs locally on the coordinator; it is not a backend.
        num_backends -= 1;
    }
    schedule.num_backends = num_backends;
    Ok(())
}

/// Computes sender counts and destination lists for every exchange edge.
fn compute_exchange_edges(
    request: &QueryExecRequest,
    params: &mut [FragmentExecParams],
) -> Result<()> {
    for idx in 1..request.fragments.len() {
        let dest_idx = *request.dest_fragment_idx.get(idx - 1).ok_or_else(|| {
            KiteError::Planning(format!("fragment {idx} has no destination fragment index"))
        })?;
        if dest_idx >= params.len() {
            return Err(KiteError::Planning(format!(
                "fragment {idx} targets out-of-range fragment {dest_idx}"
            )));
        }
        let sink = request.fragments[idx].stream_sink().ok_or_else(|| {
            KiteError::Planning(format!("non-root fragment {idx} has no stream sink"))
        })?;
        let exch_id = sink.dest_node;
        let num_senders = params[idx].hosts.len();

        // Multiple fragments may feed one exchange (distributed merge), so
        // sender counts add up.
        *params[dest_idx]
            .per_exch_num_senders
            .entry(exch_id)
            .or_insert(0) += num_senders;

        let destinations: Vec<FragmentDestination> = params[dest_idx]
            .hosts
            .iter()
            .zip(params[dest_idx].instance_ids.iter())
            .map(|(server, instance_id)| FragmentDestination {
                instance_id: *instance_id,
                server: server.clone(),
            })
            .collect();
        for dest in &destinations {
            debug!(
                fragment_idx = idx,
                instance_id = %dest.instance_id,
                server = %dest.server,
                operator = "CoordinatorSchedule",
                "fragment destination"
            );
        }
        params[idx].destinations = destinations;
    }
    Ok(())
}

/// Distributes every scan node's ranges to that fragment's execution hosts.
fn compute_scan_range_assignment(
    request: &QueryExecRequest,
    schedule: &mut QuerySchedule,
) -> Result<()> {
    let mut node_fragment_idx: HashMap<PlanNodeId, usize> = HashMap::new();
    for (idx, fragment) in request.fragments.iter().enumerate() {
        for node_id in fragment.plan.node_ids() {
            node_fragment_idx.insert(node_id, idx);
        }
    }

    schedule.scan_range_assignment =
        vec![FragmentScanRangeAssignment::default(); request.fragments.len()];

    // Stable node order keeps the assignment deterministic.
    let mut node_ids: Vec<PlanNodeId> = request.per_node_scan_ranges.keys().copied().collect();
    node_ids.sort_by_key(|id| id.0);

    for node_id in node_ids {
        let locations = &request.per_node_scan_ranges[&node_id];
        let fragment_idx = *node_fragment_idx.get(&node_id).ok_or_else(|| {
            KiteError::Planning(format!("scan ranges reference unknown plan node {node_id}"))
        })?;
        assign_node_scan_ranges(
            node_id,
            locations,
            &schedule.fragment_exec_params[fragment_idx],
            &mut schedule.scan_range_assignment[fragment_idx],
        )?;
        schedule.num_scan_ranges += locations.len();
    }
    Ok(())
}

/// Assigns one scan node's ranges, balancing bytes across data hosts.
///
/// Each range goes to the replica whose data host currently has the fewest
/// assigned bytes (first occurrence wins ties), then the data host is
/// translated to its execution host.
fn assign_node_scan_ranges(
    node_id: PlanNodeId,
    locations: &[ScanRangeLocations],
    params: &FragmentExecParams,
    assignment: &mut FragmentScanRangeAssignment,
) -> Result<()> {
    let mut assigned_bytes: HashMap<HostPort, i64> = HashMap::new();
    for scan_range_locations in locations {
        let mut chosen: Option<&kite_plan::ScanRangeLocation> = None;
        let mut min_assigned = i64::MAX;
        for location in &scan_range_locations.locations {
            let bytes = assigned_bytes
                .get(&location.server)
                .copied()
                .unwrap_or(0);
            if bytes < min_assigned {
                min_assigned = bytes;
                chosen = Some(location);
            }
        }
        let chosen = chosen.ok_or_else(|| {
            KiteError::Planning(format!("scan range of node {node_id} has no locations"))
        })?;
        *assigned_bytes.entry(chosen.server.clone()).or_insert(0) +=
            scan_range_locations.scan_range.length();

        let exec_host = if params.hosts.len() == 1 {
            // Only one place this can run, typically the coordinator.
            params.hosts[0].clone()
        } else {
            params
                .data_server_map
                .get(&chosen.server)
                .cloned()
                .ok_or_else(|| {
                    KiteError::Internal(format!(
                        "data host {} missing from data-server map of node {node_id}",
                        chosen.server
                    ))
                })?
        };

        assignment
            .entry(exec_host)
            .or_default()
            .entry(node_id)
            .or_default()
            .push(ScanRangeParams {
                scan_range: scan_range_locations.scan_range.clone(),
                volume_id: chosen.volume_id,
            });
    }
    Ok(())
}

/// Builds the dispatch payload for instance `instance_idx` of a fragment.
#[allow(clippy::too_many_arguments)]
pub fn build_exec_fragment_request(
    query_id: UniqueId,
    request: &QueryExecRequest,
    fragment_idx: usize,
    params: &FragmentExecParams,
    instance_idx: usize,
    assignment: &FragmentScanRangeAssignment,
    coord: &HostPort,
    backend_num: usize,
    options: &QueryOptions,
) -> ExecFragmentRequest {
    let exec_host = &params.hosts[instance_idx];
    let per_node_scan_ranges = assignment.get(exec_host).cloned().unwrap_or_default();
    ExecFragmentRequest {
        query_id,
        instance_id: params.instance_ids[instance_idx],
        fragment: request.fragments[fragment_idx].clone(),
        desc_tbl: request.desc_tbl.clone(),
        per_node_scan_ranges,
        per_exch_num_senders: params.per_exch_num_senders.clone(),
        destinations: params.destinations.clone(),
        coord: coord.clone(),
        backend_num,
        query_options: options.clone(),
        query_globals: request.query_globals.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kite_plan::{
        FileSplit, OutputSink, PartitionKind, PlanFragment, PlanNode, PlanTree, QueryGlobals,
        ScanRange, ScanRangeLocation, StreamSink,
    };

    fn host(ip: &str) -> HostPort {
        HostPort::new(ip, 21000)
    }

    fn node(id: i32, node_type: PlanNodeType, num_children: usize) -> PlanNode {
        PlanNode {
            node_id: PlanNodeId(id),
            node_type,
            num_children,
        }
    }

    fn scan_fragment(scan_id: i32, dest_exch: i32) -> PlanFragment {
        PlanFragment {
            plan: PlanTree {
                nodes: vec![node(scan_id, PlanNodeType::Scan, 0)],
            },
            partition: PartitionKind::HashPartitioned,
            output_sink: Some(OutputSink::Stream(StreamSink {
                dest_node: PlanNodeId(dest_exch),
                output_partition: PartitionKind::Unpartitioned,
            })),
        }
    }

    fn root_fragment(exch_ids: &[i32]) -> PlanFragment {
        let mut nodes = vec![node(9, PlanNodeType::Other, exch_ids.len())];
        for id in exch_ids {
            nodes.push(node(*id, PlanNodeType::Exchange, 0));
        }
        PlanFragment {
            plan: PlanTree { nodes },
            partition: PartitionKind::Unpartitioned,
            output_sink: None,
        }
    }

    fn ranges_on(hosts: &[&str], lengths: &[i64]) -> Vec<ScanRangeLocations> {
        lengths
            .iter()
            .enumerate()
            .map(|(i, len)| ScanRangeLocations {
                scan_range: ScanRange {
                    file_split: Some(FileSplit {
                        path: format!("/data/part-{i}"),
                        offset: 0,
                        length: *len,
                    }),
                },
                locations: hosts
                    .iter()
                    .map(|h| ScanRangeLocation {
                        server: host(h),
                        volume_id: 0,
                    })
                    .collect(),
            })
            .collect()
    }

    fn request_with(
        fragments: Vec<PlanFragment>,
        dest_fragment_idx: Vec<usize>,
        per_node_scan_ranges: HashMap<PlanNodeId, Vec<ScanRangeLocations>>,
    ) -> QueryExecRequest {
        QueryExecRequest {
            fragments,
            dest_fragment_idx,
            per_node_scan_ranges,
            desc_tbl: serde_json::Value::Null,
            query_globals: QueryGlobals::default(),
            finalize_params: None,
        }
    }

    fn schedule_for(request: &QueryExecRequest) -> QuerySchedule {
        compute_query_schedule(
            UniqueId::new(1, 100),
            request,
            &ColocatedScheduler,
            &host("10.0.0.99"),
        )
        .expect("schedule")
    }

    #[test]
    fn unpartitioned_root_runs_on_coordinator() {
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::from([(PlanNodeId(0), ranges_on(&["10.0.0.1", "10.0.0.2"], &[64, 64]))]),
        );
        let schedule = schedule_for(&request);

        assert_eq!(schedule.fragment_exec_params[0].hosts, vec![host("10.0.0.99")]);
        assert_eq!(schedule.fragment_exec_params[1].hosts.len(), 2);
        // local root is excluded from the backend count
        assert_eq!(schedule.num_backends, 2);
        assert_eq!(schedule.num_scan_ranges, 2);
    }

    #[test]
    fn scanless_fragment_inherits_input_hosts() {
        // fragment 1 aggregates over exchange 6, fed by scan fragment 2.
        let agg = PlanFragment {
            plan: PlanTree {
                nodes: vec![
                    node(7, PlanNodeType::Other, 1),
                    node(6, PlanNodeType::Exchange, 0),
                ],
            },
            partition: PartitionKind::HashPartitioned,
            output_sink: Some(OutputSink::Stream(StreamSink {
                dest_node: PlanNodeId(5),
                output_partition: PartitionKind::Unpartitioned,
            })),
        };
        let request = request_with(
            vec![root_fragment(&[5]), agg, scan_fragment(0, 6)],
            vec![0, 1],
            HashMap::from([(PlanNodeId(0), ranges_on(&["10.0.0.1", "10.0.0.2"], &[64, 64]))]),
        );
        let schedule = schedule_for(&request);

        assert_eq!(
            schedule.fragment_exec_params[1].hosts,
            schedule.fragment_exec_params[2].hosts
        );
    }

    #[test]
    fn scan_without_ranges_falls_back_to_coordinator() {
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::new(),
        );
        let schedule = schedule_for(&request);
        assert_eq!(schedule.fragment_exec_params[1].hosts, vec![host("10.0.0.99")]);
    }

    #[test]
    fn instance_ids_are_distinct_and_derived_from_query_lo() {
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::from([(
                PlanNodeId(0),
                ranges_on(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], &[64, 64, 64]),
            )]),
        );
        let schedule = schedule_for(&request);
        let mut all_ids: Vec<UniqueId> = schedule
            .fragment_exec_params
            .iter()
            .flat_map(|p| p.instance_ids.iter().copied())
            .collect();
        let total = all_ids.len();
        all_ids.sort_by_key(|id| (id.hi, id.lo));
        all_ids.dedup();
        assert_eq!(all_ids.len(), total);
        assert!(all_ids.iter().all(|id| id.hi == 1 && id.lo > 100));
    }

    #[test]
    fn instance_id_overflow_is_rejected() {
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::from([(PlanNodeId(0), ranges_on(&["10.0.0.1"], &[64]))]),
        );
        let err = compute_query_schedule(
            UniqueId::new(1, i64::MAX - 1),
            &request,
            &ColocatedScheduler,
            &host("10.0.0.99"),
        )
        .expect_err("overflow");
        assert!(matches!(err, KiteError::Planning(_)));
    }

    #[test]
    fn sender_counts_reconstruct_fragment_topology() {
        // two scan fragments feed exchange 5, one feeds exchange 6
        let request = request_with(
            vec![
                root_fragment(&[5, 6]),
                scan_fragment(0, 5),
                scan_fragment(1, 5),
                scan_fragment(2, 6),
            ],
            vec![0, 0, 0],
            HashMap::from([
                (PlanNodeId(0), ranges_on(&["10.0.0.1", "10.0.0.2"], &[64, 64])),
                (PlanNodeId(1), ranges_on(&["10.0.0.3"], &[64])),
                (PlanNodeId(2), ranges_on(&["10.0.0.4"], &[64])),
            ]),
        );
        let schedule = schedule_for(&request);

        let senders = &schedule.fragment_exec_params[0].per_exch_num_senders;
        let instances = |idx: usize| schedule.fragment_exec_params[idx].instance_ids.len();
        assert_eq!(senders[&PlanNodeId(5)], instances(1) + instances(2));
        assert_eq!(senders[&PlanNodeId(6)], instances(3));
    }

    #[test]
    fn destination_lists_match_parent_host_count() {
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::from([(PlanNodeId(0), ranges_on(&["10.0.0.1", "10.0.0.2"], &[64, 64]))]),
        );
        let schedule = schedule_for(&request);
        assert_eq!(
            schedule.fragment_exec_params[1].destinations.len(),
            schedule.fragment_exec_params[0].hosts.len()
        );
    }

    #[test]
    fn replicated_ranges_balance_across_hosts() {
        // three equal ranges replicated on {X, Y}: one host ends up with two,
        // the other with one, never three/zero.
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::from([(
                PlanNodeId(0),
                ranges_on(&["10.0.0.1", "10.0.0.2"], &[100, 100, 100]),
            )]),
        );
        let schedule = schedule_for(&request);

        let assignment = &schedule.scan_range_assignment[1];
        let mut per_host_bytes: Vec<i64> = assignment
            .values()
            .map(|by_node| {
                by_node[&PlanNodeId(0)]
                    .iter()
                    .map(|r| r.scan_range.length())
                    .sum()
            })
            .collect();
        per_host_bytes.sort();
        assert_eq!(per_host_bytes, vec![100, 200]);
    }

    #[test]
    fn every_range_is_assigned_exactly_once() {
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::from([(
                PlanNodeId(0),
                ranges_on(&["10.0.0.1", "10.0.0.2", "10.0.0.3"], &[10, 20, 30, 40, 50]),
            )]),
        );
        let schedule = schedule_for(&request);

        let mut assigned_paths: Vec<String> = schedule.scan_range_assignment[1]
            .values()
            .flat_map(|by_node| by_node.values().flatten())
            .filter_map(|r| r.scan_range.file_split.as_ref().map(|s| s.path.clone()))
            .collect();
        assigned_paths.sort();
        let expected: Vec<String> = (0..5).map(|i| format!("/data/part-{i}")).collect();
        assert_eq!(assigned_paths, expected);
    }

    #[test]
    fn assignment_is_deterministic_for_one_input_order() {
        let ranges = ranges_on(&["10.0.0.1", "10.0.0.2"], &[10, 20, 30, 40]);
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::from([(PlanNodeId(0), ranges)]),
        );
        let first = schedule_for(&request);
        let second = schedule_for(&request);

        for host in first.scan_range_assignment[1].keys() {
            let a: Vec<_> = first.scan_range_assignment[1][host][&PlanNodeId(0)]
                .iter()
                .map(|r| r.scan_range.file_split.as_ref().unwrap().path.clone())
                .collect();
            let b: Vec<_> = second.scan_range_assignment[1][host][&PlanNodeId(0)]
                .iter()
                .map(|r| r.scan_range.file_split.as_ref().unwrap().path.clone())
                .collect();
            assert_eq!(a, b);
        }
    }

    #[test]
    fn dispatch_payload_carries_host_scan_ranges() {
        let request = request_with(
            vec![root_fragment(&[5]), scan_fragment(0, 5)],
            vec![0],
            HashMap::from([(PlanNodeId(0), ranges_on(&["10.0.0.1"], &[128, 256]))]),
        );
        let schedule = schedule_for(&request);
        let params = &schedule.fragment_exec_params[1];
        let rpc = build_exec_fragment_request(
            UniqueId::new(1, 100),
            &request,
            1,
            params,
            0,
            &schedule.scan_range_assignment[1],
            &host("10.0.0.99"),
            0,
            &QueryOptions::default(),
        );
        assert_eq!(rpc.instance_id, params.instance_ids[0]);
        assert_eq!(rpc.total_split_size(), 384);
        assert_eq!(rpc.destinations.len(), 1);
        assert_eq!(rpc.per_exch_num_senders.len(), 0);
    }
}
