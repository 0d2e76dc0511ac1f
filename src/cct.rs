//! Calling-context tree
//!
//! A [`CallTree`] aggregates sampled call stacks: each distinct path from the thread
//! entry point is one node. [`CallTree::walk`] visits it depth-first and drives a
//! [`CctVisitor`]; [`MarkTimeCollector`] is the visitor that sums self time per mark.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::marking::{MarkTracker, MarkingEngine};
use crate::types::Mark;
use crate::wire::MethodId;

const ROOT: usize = 0;

/// One calling context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallNode {
    method_id: MethodId,
    parent: Option<usize>,
    children: Vec<usize>,
    self_time: u64,
    total_time: u64,
    samples: u64,
}

impl CallNode {
    fn new(method_id: MethodId, parent: Option<usize>) -> Self {
        Self { method_id, parent, children: Vec::new(), self_time: 0, total_time: 0, samples: 0 }
    }

    pub fn method_id(&self) -> MethodId {
        self.method_id
    }

    /// Time spent in this context excluding callees.
    pub fn self_time(&self) -> u64 {
        self.self_time
    }

    /// Time spent in this context including callees.
    pub fn total_time(&self) -> u64 {
        self.total_time
    }

    /// Number of stacks that passed through this context.
    pub fn samples(&self) -> u64 {
        self.samples
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }
}

/// Called by [`CallTree::walk`].
///
/// Every `on_node` is followed by exactly one `on_backout` for the same node, after
/// all of its descendants have been visited. `on_start` sees the synthetic root, whose
/// self time is the time of empty stacks.
pub trait CctVisitor {
    fn on_start(&mut self, _root: &CallNode) {}
    fn on_node(&mut self, node: &CallNode);
    fn on_backout(&mut self, node: &CallNode);
    fn on_stop(&mut self) {}
}

/// Calling-context tree built from sampled stacks.
#[derive(Debug, Clone)]
pub struct CallTree {
    nodes: Vec<CallNode>,
}

impl Default for CallTree {
    fn default() -> Self {
        Self::new()
    }
}

impl CallTree {
    pub fn new() -> Self {
        Self { nodes: vec![CallNode::new(0, None)] }
    }

    /// Adds one stack, outermost frame first, and charges `time` to its innermost frame.
    pub fn add_stack(&mut self, stack: &[MethodId], time: u64) {
        let mut current = ROOT;
        self.nodes[ROOT].total_time += time;
        self.nodes[ROOT].samples += 1;

        for &method_id in stack {
            current = self.child_for(current, method_id);
            let node = &mut self.nodes[current];
            node.total_time += time;
            node.samples += 1;
        }
        self.nodes[current].self_time += time;
    }

    fn child_for(&mut self, parent: usize, method_id: MethodId) -> usize {
        if let Some(&existing) =
            self.nodes[parent].children.iter().find(|&&c| self.nodes[c].method_id == method_id)
        {
            return existing;
        }
        let index = self.nodes.len();
        self.nodes.push(CallNode::new(method_id, Some(parent)));
        self.nodes[parent].children.push(index);
        index
    }

    /// Number of contexts, not counting the synthetic root.
    pub fn len(&self) -> usize {
        self.nodes.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time of every stack added so far.
    pub fn total_time(&self) -> u64 {
        self.nodes[ROOT].total_time
    }

    /// Time charged to empty stacks.
    pub fn unattributed_time(&self) -> u64 {
        self.nodes[ROOT].self_time
    }

    /// Distinct method ids in the tree, ascending.
    pub fn method_ids(&self) -> Vec<MethodId> {
        let ids: BTreeSet<MethodId> = self.nodes[1..].iter().map(|n| n.method_id).collect();
        ids.into_iter().collect()
    }

    /// Depth of the context at `index`; top-level contexts have depth 1.
    fn depth(&self, mut index: usize) -> usize {
        let mut depth = 0;
        while let Some(parent) = self.nodes[index].parent {
            depth += 1;
            index = parent;
        }
        depth
    }

    pub fn max_depth(&self) -> usize {
        (1..self.nodes.len()).map(|i| self.depth(i)).max().unwrap_or(0)
    }

    /// Depth-first traversal in insertion order. The synthetic root is not visited.
    pub fn walk<V: CctVisitor + ?Sized>(&self, visitor: &mut V) {
        visitor.on_start(&self.nodes[ROOT]);

        // (node, next child position)
        let mut stack: Vec<(usize, usize)> = vec![(ROOT, 0)];
        while let Some(top) = stack.last_mut() {
            let (index, position) = *top;
            match self.nodes[index].children.get(position) {
                Some(&child) => {
                    top.1 += 1;
                    visitor.on_node(&self.nodes[child]);
                    stack.push((child, 0));
                }
                None => {
                    stack.pop();
                    if index != ROOT {
                        visitor.on_backout(&self.nodes[index]);
                    }
                }
            }
        }

        visitor.on_stop();
    }
}

/// Sums the self time of every context per mark in effect. Time of empty stacks goes to
/// [`Mark::DEFAULT`].
#[derive(Debug)]
pub struct MarkTimeCollector {
    engine: Arc<MarkingEngine>,
    tracker: MarkTracker,
    times: BTreeMap<Mark, u64>,
}

impl MarkTimeCollector {
    pub fn new(engine: Arc<MarkingEngine>) -> Self {
        let tracker = MarkTracker::new(Arc::clone(&engine));
        Self { engine, tracker, times: BTreeMap::new() }
    }

    pub fn times(&self) -> &BTreeMap<Mark, u64> {
        &self.times
    }

    pub fn time_of(&self, mark: Mark) -> u64 {
        self.times.get(&mark).copied().unwrap_or(0)
    }

    /// Per-mark times with display labels, largest first.
    pub fn report(&self) -> Vec<(String, u64)> {
        let mut rows: Vec<(String, u64)> =
            self.times.iter().map(|(&mark, &time)| (self.engine.label(mark), time)).collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        rows
    }

    pub fn into_times(self) -> BTreeMap<Mark, u64> {
        self.times
    }
}

impl CctVisitor for MarkTimeCollector {
    fn on_start(&mut self, root: &CallNode) {
        self.tracker.begin_transaction();
        self.tracker.on_start();
        self.times.clear();
        if root.self_time() > 0 {
            self.times.insert(Mark::DEFAULT, root.self_time());
        }
    }

    fn on_node(&mut self, node: &CallNode) {
        let mark = self.tracker.on_node(node.method_id());
        if node.self_time() > 0 {
            *self.times.entry(mark).or_insert(0) += node.self_time();
        }
    }

    fn on_backout(&mut self, _node: &CallNode) {
        self.tracker.on_backout();
    }

    fn on_stop(&mut self) {
        self.tracker.on_stop();
        self.tracker.end_transaction();
        debug!("Collected time for {} marks", self.times.len());
    }
}
