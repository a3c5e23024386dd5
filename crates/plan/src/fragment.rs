use kite_common::ids::PlanNodeId;
use serde::{Deserialize, Serialize};

/// Node categories the control plane distinguishes.
///
/// The coordinator never interprets operator semantics; it only needs to tell
/// scans (placement by data locality) and exchanges (fragment boundaries)
/// apart from everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanNodeType {
    /// Reads table data from scan ranges.
    Scan,
    /// Receives streamed rows from an upstream fragment's sink.
    Exchange,
    /// Any other operator (joins, aggregates, projections, ...).
    Other,
}

/// One operator in a flattened plan tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanNode {
    /// Plan-wide node id assigned by the frontend.
    pub node_id: PlanNodeId,
    /// Control-plane node category.
    pub node_type: PlanNodeType,
    /// Number of direct children in the operator tree.
    pub num_children: usize,
}

/// Operator tree of one fragment, flattened in preorder.
///
/// Preorder flattening means a depth-first walk always visits a node before
/// its children, so the first node without children is the leftmost leaf.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanTree {
    /// Nodes in preorder.
    pub nodes: Vec<PlanNode>,
}

impl PlanTree {
    /// Returns the id of the leftmost leaf iff its type is in `types`,
    /// else [`PlanNodeId::INVALID`].
    pub fn find_leftmost_of_types(&self, types: &[PlanNodeType]) -> PlanNodeId {
        let Some(node) = self.nodes.iter().find(|n| n.num_children == 0) else {
            return PlanNodeId::INVALID;
        };
        if types.contains(&node.node_type) {
            node.node_id
        } else {
            PlanNodeId::INVALID
        }
    }

    /// Node ids of every node in this tree.
    pub fn node_ids(&self) -> impl Iterator<Item = PlanNodeId> + '_ {
        self.nodes.iter().map(|n| n.node_id)
    }
}

/// How a fragment's instances are spread over the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PartitionKind {
    /// One instance, conventionally on the coordinator host.
    Unpartitioned,
    /// Instances partitioned by a hash of the input.
    HashPartitioned,
    /// Instances partitioned without a placement key.
    RandomPartitioned,
}

impl PartitionKind {
    /// Returns whether the fragment runs more than one instance.
    pub fn is_partitioned(self) -> bool {
        !matches!(self, PartitionKind::Unpartitioned)
    }
}

/// Streaming output sink feeding an exchange node in a consumer fragment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSink {
    /// Exchange node receiving this fragment's rows.
    pub dest_node: PlanNodeId,
    /// Partitioning of the outgoing stream.
    pub output_partition: PartitionKind,
}

/// Table sink writing query output to a filesystem table location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSink {
    /// Base directory of the target table.
    pub base_dir: String,
    /// Whether existing table data is replaced.
    pub overwrite: bool,
}

/// Fragment output destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OutputSink {
    /// Rows stream to an exchange node.
    Stream(StreamSink),
    /// Rows are written to a table location.
    Table(TableSink),
}

/// One plan fragment: an operator tree plus an optional output sink.
///
/// Fragment 0 is the root. The root has no stream sink; every non-root
/// fragment streams into some downstream fragment's exchange node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFragment {
    /// Operator tree executed by each instance.
    pub plan: PlanTree,
    /// Instance spread for this fragment.
    pub partition: PartitionKind,
    /// Output destination, if the fragment has one.
    pub output_sink: Option<OutputSink>,
}

impl PlanFragment {
    /// The stream sink, if this fragment feeds an exchange node.
    pub fn stream_sink(&self) -> Option<&StreamSink> {
        match &self.output_sink {
            Some(OutputSink::Stream(sink)) => Some(sink),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{PlanNode, PlanNodeType, PlanTree};
    use kite_common::ids::PlanNodeId;

    fn node(id: i32, node_type: PlanNodeType, num_children: usize) -> PlanNode {
        PlanNode {
            node_id: PlanNodeId(id),
            node_type,
            num_children,
        }
    }

    #[test]
    fn leftmost_leaf_is_first_childless_node() {
        // join(scan, exchange) flattened preorder
        let tree = PlanTree {
            nodes: vec![
                node(2, PlanNodeType::Other, 2),
                node(0, PlanNodeType::Scan, 0),
                node(1, PlanNodeType::Exchange, 0),
            ],
        };
        assert_eq!(
            tree.find_leftmost_of_types(&[PlanNodeType::Scan]),
            PlanNodeId(0)
        );
        assert_eq!(
            tree.find_leftmost_of_types(&[PlanNodeType::Exchange]),
            PlanNodeId::INVALID
        );
    }

    #[test]
    fn empty_tree_has_no_leftmost_leaf() {
        let tree = PlanTree { nodes: vec![] };
        assert_eq!(
            tree.find_leftmost_of_types(&[PlanNodeType::Scan]),
            PlanNodeId::INVALID
        );
    }
}
