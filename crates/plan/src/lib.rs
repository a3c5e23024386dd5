//! Plan-fragment data model shared by the frontend, coordinator, and workers.
//!
//! Architecture role:
//! - serializable operator trees, fragments, and scan-range locations as
//!   produced by the frontend planner;
//! - the [`QueryExecRequest`] envelope the coordinator receives per query;
//! - fragment-graph topology helpers (leftmost-node and leftmost-input
//!   searches) used when assigning execution hosts.
//!
//! Key modules:
//! - [`fragment`]
//! - [`request`]

pub mod fragment;
pub mod request;

pub use fragment::{
    OutputSink, PartitionKind, PlanFragment, PlanNode, PlanNodeType, PlanTree, StreamSink,
    TableSink,
};
pub use request::{
    FileSplit, FinalizeParams, QueryExecRequest, QueryGlobals, QueryOptions, ScanRange,
    ScanRangeLocation, ScanRangeLocations, ScanRangeParams,
};
