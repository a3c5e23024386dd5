//! The per-query request envelope handed to the coordinator.
//!
//! Contract:
//! - `fragments[0]` is the root fragment;
//! - `dest_fragment_idx[i]` names the fragment consuming fragment `i + 1`'s
//!   stream sink (the root has no destination);
//! - `per_node_scan_ranges` maps each scan node to the replica locations of
//!   every range it reads.

use std::collections::HashMap;

use kite_common::ids::{HostPort, PlanNodeId};
use serde::{Deserialize, Serialize};

use crate::fragment::{PlanFragment, PlanNodeType};

/// A contiguous byte range of one file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSplit {
    /// Absolute file path.
    pub path: String,
    /// Byte offset of the split start.
    pub offset: i64,
    /// Split length in bytes.
    pub length: i64,
}

/// One scan range; non-file sources carry no split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRange {
    /// File split backing this range, if any.
    pub file_split: Option<FileSplit>,
}

impl ScanRange {
    /// Split length in bytes; 0 for non-file ranges.
    pub fn length(&self) -> i64 {
        self.file_split.as_ref().map_or(0, |split| split.length)
    }
}

/// One replica location of a scan range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRangeLocation {
    /// Data host storing the replica.
    pub server: HostPort,
    /// Storage volume hint on that host, or -1 when unknown.
    pub volume_id: i32,
}

/// A scan range together with all hosts storing a replica of it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRangeLocations {
    /// The range itself.
    pub scan_range: ScanRange,
    /// Replica locations, in frontend order.
    pub locations: Vec<ScanRangeLocation>,
}

/// A scan range as dispatched to one execution host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRangeParams {
    /// The range to read.
    pub scan_range: ScanRange,
    /// Volume hint of the chosen replica.
    pub volume_id: i32,
}

/// Per-query execution options, forwarded opaquely to every instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    /// Target rows per batch.
    pub batch_size: usize,
    /// Per-instance memory limit in bytes; 0 means unlimited.
    pub mem_limit_bytes: u64,
    /// Error-log lines retained per instance.
    pub max_errors: usize,
    /// Requested cluster width; 0 lets the planner decide.
    pub num_nodes: usize,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            batch_size: 8192,
            mem_limit_bytes: 0,
            max_errors: 100,
            num_nodes: 0,
        }
    }
}

/// Query-global constants captured at planning time, forwarded opaquely.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryGlobals {
    /// Statement timestamp, pre-rendered by the frontend.
    pub now_string: String,
}

/// Filesystem-commit parameters for bulk-insert queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeParams {
    /// Target table name, for logs and catalog updates.
    pub table_name: String,
    /// Base directory of the target table.
    pub base_dir: String,
    /// Whether existing table data is replaced.
    pub is_overwrite: bool,
}

/// Fully planned query as produced by the frontend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExecRequest {
    /// Plan fragments; index 0 is the root.
    pub fragments: Vec<PlanFragment>,
    /// Destination fragment index per non-root fragment:
    /// `dest_fragment_idx[i]` consumes fragment `i + 1`.
    pub dest_fragment_idx: Vec<usize>,
    /// Replica locations for every scan node in the query.
    pub per_node_scan_ranges: HashMap<PlanNodeId, Vec<ScanRangeLocations>>,
    /// Descriptor table, forwarded verbatim to every instance.
    pub desc_tbl: serde_json::Value,
    /// Query-global constants.
    pub query_globals: QueryGlobals,
    /// Present iff the query is a bulk insert needing filesystem finalization.
    pub finalize_params: Option<FinalizeParams>,
}

impl QueryExecRequest {
    /// Finds the fragment whose stream sink feeds `fragment_idx`'s leftmost
    /// exchange node.
    ///
    /// Returns `None` when the fragment's leftmost leaf is not an exchange
    /// node, or when no producer targets that exchange (a malformed graph).
    pub fn find_leftmost_input_fragment(&self, fragment_idx: usize) -> Option<usize> {
        let exch_id = self.fragments[fragment_idx]
            .plan
            .find_leftmost_of_types(&[PlanNodeType::Exchange]);
        if !exch_id.is_valid() {
            return None;
        }

        for (i, dest_idx) in self.dest_fragment_idx.iter().enumerate() {
            if *dest_idx != fragment_idx {
                continue;
            }
            let input_fragment = &self.fragments[i + 1];
            if input_fragment
                .stream_sink()
                .is_some_and(|sink| sink.dest_node == exch_id)
            {
                return Some(i + 1);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{OutputSink, PartitionKind, PlanNode, PlanTree, StreamSink};

    fn fragment(nodes: Vec<PlanNode>, sink_dest: Option<i32>) -> PlanFragment {
        PlanFragment {
            plan: PlanTree { nodes },
            partition: PartitionKind::HashPartitioned,
            output_sink: sink_dest.map(|dest| {
                OutputSink::Stream(StreamSink {
                    dest_node: PlanNodeId(dest),
                    output_partition: PartitionKind::Unpartitioned,
                })
            }),
        }
    }

    fn node(id: i32, node_type: PlanNodeType, num_children: usize) -> PlanNode {
        PlanNode {
            node_id: PlanNodeId(id),
            node_type,
            num_children,
        }
    }

    #[test]
    fn resolves_leftmost_input_fragment() {
        // fragment 0: agg over exchange 5; fragments 1 and 2 send to exchanges 5 and 6.
        let request = QueryExecRequest {
            fragments: vec![
                fragment(
                    vec![
                        node(7, PlanNodeType::Other, 2),
                        node(5, PlanNodeType::Exchange, 0),
                        node(6, PlanNodeType::Exchange, 0),
                    ],
                    None,
                ),
                fragment(vec![node(0, PlanNodeType::Scan, 0)], Some(5)),
                fragment(vec![node(1, PlanNodeType::Scan, 0)], Some(6)),
            ],
            dest_fragment_idx: vec![0, 0],
            per_node_scan_ranges: HashMap::new(),
            desc_tbl: serde_json::Value::Null,
            query_globals: QueryGlobals::default(),
            finalize_params: None,
        };

        assert_eq!(request.find_leftmost_input_fragment(0), Some(1));
    }

    #[test]
    fn no_input_fragment_when_leftmost_is_a_scan() {
        let request = QueryExecRequest {
            fragments: vec![fragment(vec![node(0, PlanNodeType::Scan, 0)], None)],
            dest_fragment_idx: vec![],
            per_node_scan_ranges: HashMap::new(),
            desc_tbl: serde_json::Value::Null,
            query_globals: QueryGlobals::default(),
            finalize_params: None,
        };
        assert_eq!(request.find_leftmost_input_fragment(0), None);
    }

    #[test]
    fn request_round_trips_through_json() {
        let request = QueryExecRequest {
            fragments: vec![fragment(vec![node(0, PlanNodeType::Scan, 0)], None)],
            dest_fragment_idx: vec![],
            per_node_scan_ranges: HashMap::from([(
                PlanNodeId(0),
                vec![ScanRangeLocations {
                    scan_range: ScanRange {
                        file_split: Some(FileSplit {
                            path: "/data/t/part-0".to_string(),
                            offset: 0,
                            length: 1024,
                        }),
                    },
                    locations: vec![ScanRangeLocation {
                        server: HostPort::new("10.0.0.1", 21000),
                        volume_id: 2,
                    }],
                }],
            )]),
            desc_tbl: serde_json::json!({"tuples": []}),
            query_globals: QueryGlobals::default(),
            finalize_params: None,
        };

        let bytes = serde_json::to_vec(&request).expect("encode");
        let decoded: QueryExecRequest = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(decoded.fragments.len(), 1);
        assert_eq!(
            decoded.per_node_scan_ranges[&PlanNodeId(0)][0]
                .scan_range
                .length(),
            1024
        );
    }
}
