//! Structural statistics shared by both trie variants.

use std::collections::BTreeMap;

use crate::child::{Child, ChildPointer};
use crate::entries::Entries;
use crate::node::{NodeKind, NodePtr};

/// Memory held by nodes plus named counters:
///
/// - `height`, `numberValues`, `numberNodes`, `totalMemoryConsumption`
/// - `leafNodesOnDepth_NN`: leaves by number of nodes above them
/// - `leafNodesOnBinaryDepth_NNN`: leaves by number of BiNodes above them
/// - one counter per node kind, keyed by [`NodeKind::name`]
pub(crate) fn collect(root: ChildPointer) -> (usize, BTreeMap<String, f64>) {
    let mut stats = BTreeMap::new();
    for kind in NodeKind::ALL {
        stats.insert(kind.name().to_string(), 0.0);
    }

    let mut walk = Walk::default();
    match root.decode() {
        Child::Empty => {}
        Child::Leaf(_) => walk.leaf(0, 0),
        Child::Node(node) => walk.node(node, 0, 0, &mut stats),
    }

    stats.insert("height".to_string(), f64::from(root.height()));
    stats.insert("numberValues".to_string(), walk.values as f64);
    stats.insert("numberNodes".to_string(), walk.nodes as f64);
    stats.insert("totalMemoryConsumption".to_string(), walk.memory as f64);
    for (depth, count) in walk.by_depth {
        stats.insert(format!("leafNodesOnDepth_{:02}", depth), count as f64);
    }
    for (depth, count) in walk.by_binary_depth {
        stats.insert(format!("leafNodesOnBinaryDepth_{:03}", depth), count as f64);
    }
    (walk.memory, stats)
}

#[derive(Default)]
struct Walk {
    values: usize,
    nodes: usize,
    memory: usize,
    by_depth: BTreeMap<usize, usize>,
    by_binary_depth: BTreeMap<usize, usize>,
}

impl Walk {
    fn leaf(&mut self, depth: usize, binary_depth: usize) {
        self.values += 1;
        *self.by_depth.entry(depth).or_default() += 1;
        *self.by_binary_depth.entry(binary_depth).or_default() += 1;
    }

    fn node(&mut self, node: NodePtr, depth: usize, binary_depth: usize, stats: &mut BTreeMap<String, f64>) {
        self.nodes += 1;
        self.memory += node.memory_size();
        *stats.entry(node.kind().name().to_string()).or_default() += 1.0;

        let entry_depths = Entries::from_node(node).entry_depths();
        for i in 0..node.len() {
            let below = binary_depth + usize::from(entry_depths[i]);
            match node.child(i).decode() {
                Child::Node(child) => self.node(child, depth + 1, below, stats),
                Child::Leaf(_) => self.leaf(depth + 1, below),
                Child::Empty => {}
            }
        }
    }
}
