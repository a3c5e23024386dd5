//! Control-plane payloads exchanged between the coordinator and backends.
//!
//! Payloads travel as JSON bytes inside small RPC envelopes, the same
//! convention the engine uses for plan fragments elsewhere. Workers decode
//! [`ExecFragmentRequest`]; the coordinator decodes
//! [`ReportExecStatusRequest`] callbacks.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use kite_common::ids::{HostPort, PlanNodeId, UniqueId};
use kite_common::status::ExecStatus;
use kite_plan::{PlanFragment, QueryGlobals, QueryOptions, ScanRangeParams};
use serde::{Deserialize, Serialize};

use crate::profile::ProfileTree;

/// One receiver of a fragment's stream sink output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FragmentDestination {
    /// Instance running the receiving exchange node.
    pub instance_id: UniqueId,
    /// Backend endpoint of that instance.
    pub server: HostPort,
}

/// Dispatch payload for one fragment instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecFragmentRequest {
    /// Query this instance belongs to.
    pub query_id: UniqueId,
    /// Globally unique id of this instance.
    pub instance_id: UniqueId,
    /// The fragment's operator tree and sink.
    pub fragment: PlanFragment,
    /// Descriptor table, forwarded verbatim from the frontend.
    pub desc_tbl: serde_json::Value,
    /// Scan ranges this host reads, keyed by scan node.
    pub per_node_scan_ranges: HashMap<PlanNodeId, Vec<ScanRangeParams>>,
    /// Sender count per exchange node in this fragment.
    pub per_exch_num_senders: HashMap<PlanNodeId, usize>,
    /// Receivers of this fragment's stream sink, one per destination host.
    pub destinations: Vec<FragmentDestination>,
    /// Coordinator endpoint for status-report callbacks.
    pub coord: HostPort,
    /// Dense backend index used in status reports.
    pub backend_num: usize,
    /// Per-query execution options.
    pub query_options: QueryOptions,
    /// Query-global constants.
    pub query_globals: QueryGlobals,
}

impl ExecFragmentRequest {
    /// Sum of file-split lengths over all assigned scan ranges.
    pub fn total_split_size(&self) -> i64 {
        self.per_node_scan_ranges
            .values()
            .flatten()
            .map(|params| params.scan_range.length())
            .sum()
    }
}

/// Table-sink state reported by an instance that wrote a filesystem table.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InsertExecStatus {
    /// Rows appended per partition key.
    pub num_appended_rows: HashMap<String, i64>,
    /// Tmp path -> final path; an empty final path marks a tmp directory to
    /// delete during finalization.
    pub files_to_move: BTreeMap<String, String>,
}

/// Periodic status report sent by a running (or finished) instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportExecStatusRequest {
    /// Query the report belongs to.
    pub query_id: UniqueId,
    /// Dense backend index from the dispatch payload.
    pub backend_num: usize,
    /// Instance status; non-OK aborts the query.
    pub status: ExecStatus,
    /// True when the instance finished and will not report again.
    pub done: bool,
    /// Cumulative runtime profile since instance start.
    pub profile: ProfileTree,
    /// New error-log lines since the last report.
    pub error_log: Vec<String>,
    /// Present on the final report of table-sink fragments.
    pub insert_exec_status: Option<InsertExecStatus>,
}

/// Catalog changes produced by a bulk-insert query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogUpdate {
    /// Target table of the insert.
    pub target_table: String,
    /// Partition keys the query created or wrote to.
    pub created_partitions: BTreeSet<String>,
}
