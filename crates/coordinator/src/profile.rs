//! Runtime profile tree aggregated by the coordinator.
//!
//! Contract:
//! - profiles are cheap-clone handles over shared inner state, so instance
//!   profiles can hang off several parents (fragment root + query tree);
//! - counter values are atomics and may be read without holding any profile
//!   lock;
//! - the wire form is a preorder-flattened node list, mirroring how plan
//!   trees travel.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use kite_common::ids::PlanNodeId;
use serde::{Deserialize, Serialize};

/// Counter name under which scan nodes report read throughput.
pub const TOTAL_THROUGHPUT_COUNTER: &str = "TotalReadThroughput";
/// Counter name under which scan nodes report completed scan ranges.
pub const SCAN_RANGES_COMPLETE_COUNTER: &str = "ScanRangesComplete";

/// Unit attached to a profile counter, used only for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CounterUnit {
    /// Plain count.
    #[default]
    Unit,
    /// Bytes.
    Bytes,
    /// Bytes per second.
    BytesPerSecond,
    /// Milliseconds.
    TimeMs,
}

/// One named profile counter.
#[derive(Debug)]
pub struct Counter {
    unit: CounterUnit,
    value: AtomicI64,
}

impl Counter {
    fn new(unit: CounterUnit, value: i64) -> Self {
        Self {
            unit,
            value: AtomicI64::new(value),
        }
    }

    /// Rendering unit.
    pub fn unit(&self) -> CounterUnit {
        self.unit
    }

    /// Current value; lock-free.
    pub fn value(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Overwrites the value.
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Adds to the value.
    pub fn add(&self, delta: i64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }
}

/// Shared counter handle.
pub type CounterRef = Arc<Counter>;

#[derive(Debug)]
struct ProfileInner {
    name: RwLock<String>,
    counters: Mutex<Vec<(String, CounterRef)>>,
    info_strings: Mutex<BTreeMap<String, String>>,
    children: Mutex<Vec<RuntimeProfile>>,
}

/// Cheap-clone handle to one node of a runtime profile tree.
#[derive(Debug, Clone)]
pub struct RuntimeProfile {
    inner: Arc<ProfileInner>,
}

impl RuntimeProfile {
    /// Creates a detached profile node.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ProfileInner {
                name: RwLock::new(name.into()),
                counters: Mutex::new(Vec::new()),
                info_strings: Mutex::new(BTreeMap::new()),
                children: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Node name.
    pub fn name(&self) -> String {
        self.inner
            .name
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Renames the node (used when adopting an executor profile).
    pub fn set_name(&self, name: impl Into<String>) {
        let mut guard = self.inner.name.write().unwrap_or_else(|e| e.into_inner());
        *guard = name.into();
    }

    /// Appends a child.
    pub fn add_child(&self, child: RuntimeProfile) {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(child);
    }

    /// Direct children, in display order.
    pub fn children(&self) -> Vec<RuntimeProfile> {
        self.inner
            .children
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// All descendants in preorder, excluding `self`.
    pub fn all_children(&self) -> Vec<RuntimeProfile> {
        let mut out = Vec::new();
        for child in self.children() {
            out.push(child.clone());
            out.extend(child.all_children());
        }
        out
    }

    /// Returns the named counter, creating it with `unit` when absent.
    pub fn add_counter(&self, name: &str, unit: CounterUnit) -> CounterRef {
        let mut counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some((_, counter)) = counters.iter().find(|(n, _)| n == name) {
            return Arc::clone(counter);
        }
        let counter = Arc::new(Counter::new(unit, 0));
        counters.push((name.to_string(), Arc::clone(&counter)));
        counter
    }

    /// Looks up an existing counter.
    pub fn get_counter(&self, name: &str) -> Option<CounterRef> {
        self.inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| Arc::clone(c))
    }

    /// Attaches or replaces a rendered info string.
    pub fn add_info_string(&self, key: impl Into<String>, value: impl Into<String>) {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), value.into());
    }

    /// Looks up an info string.
    pub fn get_info_string(&self, key: &str) -> Option<String> {
        self.inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Refreshes this subtree from a cumulative wire profile.
    ///
    /// Counter values are overwritten (reports are cumulative, not deltas);
    /// missing nodes and counters are created, existing structure is kept.
    pub fn update(&self, tree: &ProfileTree) {
        if tree.nodes.is_empty() {
            return;
        }
        self.update_at(tree, 0);
    }

    fn update_at(&self, tree: &ProfileTree, idx: usize) -> usize {
        let node = &tree.nodes[idx];
        for counter in &node.counters {
            self.add_counter(&counter.name, counter.unit).set(counter.value);
        }
        for (key, value) in &node.info_strings {
            self.add_info_string(key.clone(), value.clone());
        }

        let mut next = idx + 1;
        for _ in 0..node.num_children {
            let child_name = &tree.nodes[next].name;
            let child = self
                .children()
                .into_iter()
                .find(|c| &c.name() == child_name)
                .unwrap_or_else(|| {
                    let created = RuntimeProfile::new(child_name.clone());
                    self.add_child(created.clone());
                    created
                });
            next = child.update_at(tree, next);
        }
        next
    }

    /// Adds `other`'s counter values into this subtree, creating missing
    /// counters and children. Used to accumulate instance profiles before
    /// [`RuntimeProfile::divide`] turns the sums into averages.
    pub fn merge(&self, other: &RuntimeProfile) {
        let other_counters = other
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (name, counter) in other_counters {
            self.add_counter(&name, counter.unit()).add(counter.value());
        }
        for other_child in other.children() {
            let name = other_child.name();
            let child = self
                .children()
                .into_iter()
                .find(|c| c.name() == name)
                .unwrap_or_else(|| {
                    let created = RuntimeProfile::new(name.clone());
                    self.add_child(created.clone());
                    created
                });
            child.merge(&other_child);
        }
    }

    /// Divides every counter in this subtree by `n`.
    pub fn divide(&self, n: usize) {
        if n == 0 {
            return;
        }
        let counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for (_, counter) in counters {
            counter.set(counter.value() / n as i64);
        }
        for child in self.children() {
            child.divide(n);
        }
    }

    /// Serializes this subtree to the preorder wire form.
    pub fn to_wire(&self) -> ProfileTree {
        let mut nodes = Vec::new();
        self.to_wire_nodes(&mut nodes);
        ProfileTree { nodes }
    }

    fn to_wire_nodes(&self, out: &mut Vec<ProfileNodeWire>) {
        let counters = self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(name, counter)| CounterWire {
                name: name.clone(),
                unit: counter.unit(),
                value: counter.value(),
            })
            .collect();
        let info_strings = self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let children = self.children();
        out.push(ProfileNodeWire {
            name: self.name(),
            num_children: children.len(),
            counters,
            info_strings,
        });
        for child in children {
            child.to_wire_nodes(out);
        }
    }

    /// Materializes a wire profile into a fresh tree.
    pub fn from_wire(tree: &ProfileTree) -> RuntimeProfile {
        let root = RuntimeProfile::new(
            tree.nodes
                .first()
                .map(|n| n.name.clone())
                .unwrap_or_default(),
        );
        root.update(tree);
        root
    }

    /// Indented multi-line rendering, for logs.
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        self.pretty_at(0, &mut out);
        out
    }

    fn pretty_at(&self, depth: usize, out: &mut String) {
        let indent = "  ".repeat(depth);
        out.push_str(&format!("{indent}{}:\n", self.name()));
        for (key, value) in self
            .inner
            .info_strings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            out.push_str(&format!("{indent}  {key}: {value}\n"));
        }
        for (name, counter) in self
            .inner
            .counters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
        {
            let suffix = match counter.unit() {
                CounterUnit::Unit => String::new(),
                CounterUnit::Bytes => " bytes".to_string(),
                CounterUnit::BytesPerSecond => " bytes/s".to_string(),
                CounterUnit::TimeMs => " ms".to_string(),
            };
            out.push_str(&format!("{indent}  {name}: {}{suffix}\n", counter.value()));
        }
        for child in self.children() {
            child.pretty_at(depth + 1, out);
        }
    }
}

/// One counter in the wire profile form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterWire {
    /// Counter name.
    pub name: String,
    /// Rendering unit.
    pub unit: CounterUnit,
    /// Cumulative value.
    pub value: i64,
}

/// One node in the wire profile form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileNodeWire {
    /// Node name.
    pub name: String,
    /// Number of direct children following this node.
    pub num_children: usize,
    /// Counters on this node.
    pub counters: Vec<CounterWire>,
    /// Info strings on this node.
    pub info_strings: Vec<(String, String)>,
}

/// Preorder-flattened runtime profile, as reported by instances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileTree {
    /// Nodes in preorder.
    pub nodes: Vec<ProfileNodeWire>,
}

/// Extracts the plan-node id a profile node was named after.
///
/// Exec nodes embed their id as `(id=N)` in the profile node name; profiles
/// without one return [`PlanNodeId::INVALID`].
pub fn plan_node_id_from_name(name: &str) -> PlanNodeId {
    let Some(start) = name.find("(id=") else {
        return PlanNodeId::INVALID;
    };
    let rest = &name[start + 4..];
    let Some(end) = rest.find(')') else {
        return PlanNodeId::INVALID;
    };
    rest[..end]
        .parse::<i32>()
        .map(PlanNodeId)
        .unwrap_or(PlanNodeId::INVALID)
}

/// Scan-node counters of one fragment instance, keyed by plan node.
#[derive(Debug, Default)]
pub struct FragmentInstanceCounters {
    /// Read throughput per scan node.
    pub throughput: HashMap<PlanNodeId, CounterRef>,
    /// Completed scan ranges per scan node.
    pub scan_ranges_complete: HashMap<PlanNodeId, CounterRef>,
}

/// Binds the scan-node counters found under `profile` into `counters`.
pub fn collect_scan_node_counters(profile: &RuntimeProfile, counters: &mut FragmentInstanceCounters) {
    for node in profile.all_children() {
        let id = plan_node_id_from_name(&node.name());
        if !id.is_valid() {
            continue;
        }
        if let Some(counter) = node.get_counter(TOTAL_THROUGHPUT_COUNTER) {
            counters.throughput.insert(id, counter);
        }
        if let Some(counter) = node.get_counter(SCAN_RANGES_COMPLETE_COUNTER) {
            counters.scan_ranges_complete.insert(id, counter);
        }
    }
}

/// Renders a byte count with a binary-unit suffix.
pub fn pretty_bytes(value: f64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = value.max(0.0);
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{value:.0}{}", UNITS[unit])
    } else {
        format!("{value:.2}{}", UNITS[unit])
    }
}

/// Streaming min/max/mean/stddev accumulator for summary info strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct SummaryStats {
    count: u64,
    sum: f64,
    sum_squares: f64,
    min: f64,
    max: f64,
}

impl SummaryStats {
    /// Folds one sample in.
    pub fn add(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
        self.sum_squares += value * value;
    }

    /// Number of samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Smallest sample, or 0 with no samples.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// Largest sample, or 0 with no samples.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// Sample mean, or 0 with no samples.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population standard deviation, or 0 with no samples.
    pub fn stddev(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = (self.sum_squares / self.count as f64 - mean * mean).max(0.0);
        variance.sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire_counter(name: &str, value: i64) -> CounterWire {
        CounterWire {
            name: name.to_string(),
            unit: CounterUnit::Unit,
            value,
        }
    }

    #[test]
    fn wire_round_trip_preserves_structure() {
        let root = RuntimeProfile::new("Instance x");
        let scan = RuntimeProfile::new("SCAN (id=3)");
        scan.add_counter(SCAN_RANGES_COMPLETE_COUNTER, CounterUnit::Unit)
            .set(7);
        root.add_child(scan);
        root.add_info_string("table", "lineitem");

        let decoded = RuntimeProfile::from_wire(&root.to_wire());
        assert_eq!(decoded.name(), "Instance x");
        assert_eq!(decoded.get_info_string("table").as_deref(), Some("lineitem"));
        let child = &decoded.children()[0];
        assert_eq!(child.name(), "SCAN (id=3)");
        assert_eq!(
            child
                .get_counter(SCAN_RANGES_COMPLETE_COUNTER)
                .expect("counter")
                .value(),
            7
        );
    }

    #[test]
    fn update_overwrites_cumulative_counters() {
        let profile = RuntimeProfile::new("Instance x");
        let tree = ProfileTree {
            nodes: vec![ProfileNodeWire {
                name: "Instance x".to_string(),
                num_children: 0,
                counters: vec![wire_counter("RowsProduced", 10)],
                info_strings: vec![],
            }],
        };
        profile.update(&tree);
        let tree2 = ProfileTree {
            nodes: vec![ProfileNodeWire {
                name: "Instance x".to_string(),
                num_children: 0,
                counters: vec![wire_counter("RowsProduced", 25)],
                info_strings: vec![],
            }],
        };
        profile.update(&tree2);
        assert_eq!(profile.get_counter("RowsProduced").expect("c").value(), 25);
    }

    #[test]
    fn merge_then_divide_averages_counters() {
        let averaged = RuntimeProfile::new("Averaged Fragment 1");
        for value in [10_i64, 30] {
            let instance = RuntimeProfile::new("Averaged Fragment 1");
            instance
                .add_counter("RowsProduced", CounterUnit::Unit)
                .set(value);
            averaged.merge(&instance);
        }
        averaged.divide(2);
        assert_eq!(averaged.get_counter("RowsProduced").expect("c").value(), 20);
    }

    #[test]
    fn scan_node_counters_are_discovered_by_id() {
        let root = RuntimeProfile::new("Instance x");
        let scan = RuntimeProfile::new("SCAN (id=5)");
        scan.add_counter(TOTAL_THROUGHPUT_COUNTER, CounterUnit::BytesPerSecond)
            .set(1024);
        let exchange = RuntimeProfile::new("EXCHANGE (id=7)");
        root.add_child(scan);
        root.add_child(exchange);

        let mut counters = FragmentInstanceCounters::default();
        collect_scan_node_counters(&root, &mut counters);
        assert_eq!(counters.throughput.len(), 1);
        assert_eq!(
            counters.throughput[&PlanNodeId(5)].value(),
            1024
        );
        assert!(counters.scan_ranges_complete.is_empty());
    }

    #[test]
    fn node_id_parsing_tolerates_plain_names() {
        assert_eq!(plan_node_id_from_name("SCAN (id=12)"), PlanNodeId(12));
        assert_eq!(plan_node_id_from_name("Aggregate Profile"), PlanNodeId::INVALID);
        assert_eq!(plan_node_id_from_name("(id=oops)"), PlanNodeId::INVALID);
    }

    #[test]
    fn summary_stats_track_spread() {
        let mut stats = SummaryStats::default();
        for v in [100.0, 200.0, 300.0] {
            stats.add(v);
        }
        assert_eq!(stats.min(), 100.0);
        assert_eq!(stats.max(), 300.0);
        assert_eq!(stats.mean(), 200.0);
        assert!((stats.stddev() - 81.649_658).abs() < 1e-3);
    }
}
