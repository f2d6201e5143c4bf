//! Bookkeeping of which conditional likelihood vectors are up to date.
//!
//! Every branch has two CLV slots, one per end: the slot of `(edge, node)` holds the likelihood of the subtree on the
//! `node` side of `edge`. A slot is only valid if all slots it was computed from are valid, so invalidation propagates
//! towards the slots that depend on the changed one and stops at slots that are already invalid.

use crate::kernel::ClvRef;
use crate::tree::tree::{EdgeId, NodeId, Tree};
use std::collections::BTreeSet;

/// Mutations since the last likelihood evaluation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DirtySet {
  /// Everything must be recomputed
  pub all: bool,
  /// Branches whose length changed
  pub branches: BTreeSet<EdgeId>,
  /// Nodes whose neighbors changed
  pub nodes: BTreeSet<NodeId>,
  /// Partitions whose model parameters changed
  pub partitions: BTreeSet<usize>,
}

impl DirtySet {
  pub fn is_empty(&self) -> bool {
    !self.all && self.branches.is_empty() && self.nodes.is_empty() && self.partitions.is_empty()
  }

  pub fn clear(&mut self) {
    *self = Self::default();
  }
}

#[inline]
pub fn side_slot(tree: &Tree, edge: EdgeId, node: NodeId) -> usize {
  2 * edge + usize::from(tree.branch(edge).b == node)
}

#[inline]
pub fn side_ref(tree: &Tree, edge: EdgeId, node: NodeId) -> ClvRef {
  if tree.is_tip(node) {
    ClvRef::Tip(node)
  } else {
    ClvRef::Slot(side_slot(tree, edge, node))
  }
}

/// Invalidates every slot computed from the slot of `(edge, node)`
fn invalidate_dependents(tree: &Tree, valid: &mut [bool], edge: EdgeId, node: NodeId) {
  let mut stack = vec![(edge, node)];
  while let Some((e, n)) = stack.pop() {
    let x = tree.other_end(e, n);
    for (f, _) in tree.children(x, e) {
      let slot = side_slot(tree, f, x);
      if valid[slot] {
        valid[slot] = false;
        stack.push((f, x));
      }
    }
  }
}

/// Invalidates the slots which depend on the length of `edge`
pub fn invalidate_branch(tree: &Tree, valid: &mut [bool], edge: EdgeId) {
  let branch = *tree.branch(edge);
  invalidate_dependents(tree, valid, edge, branch.a);
  invalidate_dependents(tree, valid, edge, branch.b);
}

/// Invalidates the slots of nodes whose neighborhood changed, and everything computed from them. Must be called on
/// the topology right after the change.
pub fn invalidate_nodes(tree: &Tree, valid: &mut [bool], nodes: &BTreeSet<NodeId>) {
  for &node in nodes {
    for (f, _) in tree.neighbors(node) {
      valid[side_slot(tree, f, node)] = false;
    }
  }
  for &node in nodes {
    for (f, _) in tree.neighbors(node) {
      invalidate_dependents(tree, valid, f, node);
    }
  }
}
