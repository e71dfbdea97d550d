//! Run-tree builder.
//!
//! Turns a flat list of run records into a forest. Records live in an
//! index arena; parent/child links are indices, so malformed parent data
//! can never produce an owning cycle.

use std::collections::HashMap;

use serde::Serialize;

use crate::run::RunRecord;

/// A rooted forest of runs in arena form.
#[derive(Debug, Clone, PartialEq)]
pub struct RunForest {
    records: Vec<RunRecord>,
    children: Vec<Vec<usize>>,
    roots: Vec<usize>,
}

/// Nested view of one run and its descendants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunNode {
    #[serde(flatten)]
    pub record: RunRecord,
    pub children: Vec<RunNode>,
}

impl RunNode {
    /// Number of runs in this subtree, including this one.
    #[must_use]
    pub fn subtree_len(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            count += 1;
            stack.extend(&node.children);
        }
        count
    }
}

// Parent chains can be arbitrarily deep; unlink descendants iteratively so
// dropping a tall tree cannot exhaust the stack.
impl Drop for RunNode {
    fn drop(&mut self) {
        let mut pending = std::mem::take(&mut self.children);
        while let Some(mut node) = pending.pop() {
            pending.append(&mut node.children);
        }
    }
}

impl RunForest {
    /// Root indices, in input order.
    #[must_use]
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    /// Child indices of a node, in input order.
    #[must_use]
    pub fn children(&self, idx: usize) -> &[usize] {
        self.children.get(idx).map_or(&[], Vec::as_slice)
    }

    /// Record at an index.
    #[must_use]
    pub fn record(&self, idx: usize) -> Option<&RunRecord> {
        self.records.get(idx)
    }

    /// Number of records in the forest.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the forest holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render the forest as nested nodes.
    ///
    /// Nodes are assembled bottom-up without recursion, so depth is bounded
    /// only by memory.
    #[must_use]
    pub fn into_nodes(self) -> Vec<RunNode> {
        let Self {
            records,
            children,
            roots,
        } = self;

        // Preorder places every parent before its children.
        let mut preorder = Vec::with_capacity(records.len());
        let mut stack: Vec<usize> = roots.iter().rev().copied().collect();
        while let Some(idx) = stack.pop() {
            preorder.push(idx);
            stack.extend(children[idx].iter().rev().copied());
        }

        let mut slots: Vec<Option<RunRecord>> = records.into_iter().map(Some).collect();
        let mut built: Vec<Option<RunNode>> = std::iter::repeat_with(|| None)
            .take(slots.len())
            .collect();
        for &idx in preorder.iter().rev() {
            let Some(record) = slots[idx].take() else {
                continue;
            };
            let kids = children[idx]
                .iter()
                .filter_map(|&child| built[child].take())
                .collect();
            built[idx] = Some(RunNode {
                record,
                children: kids,
            });
        }

        roots
            .iter()
            .filter_map(|&root| built[root].take())
            .collect()
    }
}

/// Build a forest from flat run records.
///
/// A record whose parent id is empty or not present in the input is a
/// root. Sibling and root order follow input order. When the same run id
/// appears more than once, the first occurrence wins.
#[must_use]
pub fn build_forest(flat_runs: &[RunRecord]) -> RunForest {
    let mut records: Vec<RunRecord> = Vec::with_capacity(flat_runs.len());
    let mut lookup: HashMap<&str, usize> = HashMap::with_capacity(flat_runs.len());

    for run in flat_runs {
        if lookup.contains_key(run.run_id.as_str()) {
            tracing::debug!(run_id = %run.run_id, "Duplicate run id in tree input");
            continue;
        }
        lookup.insert(run.run_id.as_str(), records.len());
        records.push(run.clone());
    }

    let mut parents: Vec<Option<usize>> = vec![None; records.len()];
    let mut children: Vec<Vec<usize>> = vec![Vec::new(); records.len()];
    let mut roots = Vec::new();

    for (idx, record) in records.iter().enumerate() {
        let parent = record
            .parent_run_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .and_then(|p| lookup.get(p).copied());
        match parent {
            Some(parent) => {
                parents[idx] = Some(parent);
                children[parent].push(idx);
            }
            None => roots.push(idx),
        }
    }

    break_cycles(&mut parents, &mut children, &mut roots);

    RunForest {
        records,
        children,
        roots,
    }
}

/// Records whose ancestry loops back on itself are unreachable from any
/// root. Promote the first such record (in input order) of each loop to a
/// root.
fn break_cycles(parents: &mut [Option<usize>], children: &mut [Vec<usize>], roots: &mut Vec<usize>) {
    let mut reached = vec![false; parents.len()];
    let mut stack: Vec<usize> = roots.clone();
    mark_reached(&mut stack, children, &mut reached);

    for idx in 0..parents.len() {
        if reached[idx] {
            continue;
        }
        if let Some(parent) = parents[idx].take() {
            children[parent].retain(|&c| c != idx);
        }
        tracing::warn!(index = idx, "Run parent chain forms a cycle, promoting to root");
        roots.push(idx);
        stack.push(idx);
        mark_reached(&mut stack, children, &mut reached);
    }
}

fn mark_reached(stack: &mut Vec<usize>, children: &[Vec<usize>], reached: &mut [bool]) {
    while let Some(idx) = stack.pop() {
        if reached[idx] {
            continue;
        }
        reached[idx] = true;
        stack.extend(children[idx].iter().copied());
    }
}

/// Build the nested display tree: roots only, children populated.
#[must_use]
pub fn build_tree(flat_runs: &[RunRecord]) -> Vec<RunNode> {
    build_forest(flat_runs).into_nodes()
}
