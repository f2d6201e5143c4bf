use crate::make_error;
use eyre::Report;
use itertools::Itertools;
use serde::{Deserialize, Serialize};

pub type NodeId = usize;
pub type EdgeId = usize;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Branch {
  pub a: NodeId,
  pub b: NodeId,
  pub length: f64,
}

/// Branch list of an unrooted binary tree. Tips are numbered `0..n` in taxon order, inner nodes `n..2n-2`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeTopology {
  pub branches: Vec<Branch>,
}

/// Snapshot of everything an SPR move touches, used to revert it
#[derive(Clone, Debug)]
pub struct SprMove {
  pub pruned_node: NodeId,
  pub subtree_node: NodeId,
  pub target: EdgeId,
  /// Nodes whose set of neighbors changed
  pub changed_nodes: Vec<NodeId>,
  branches: Vec<(EdgeId, Branch)>,
  adjacency: Vec<(NodeId, Vec<EdgeId>)>,
}

/// Unrooted binary tree with stable branch ids.
///
/// SPR moves reuse branch ids, so per-branch data keyed by id stays valid across topology changes.
#[derive(Clone, Debug)]
pub struct Tree {
  tip_names: Vec<String>,
  branches: Vec<Branch>,
  adjacency: Vec<Vec<EdgeId>>,
}

impl Tree {
  pub fn from_topology(tip_names: Vec<String>, topology: &TreeTopology) -> Result<Self, Report> {
    let num_tips = tip_names.len();
    if num_tips < 3 {
      return make_error!("Tree must have at least 3 tips, but found {num_tips}");
    }

    let num_nodes = 2 * num_tips - 2;
    let num_branches = 2 * num_tips - 3;
    if topology.branches.len() != num_branches {
      return make_error!(
        "Unrooted binary tree with {num_tips} tips must have {num_branches} branches, but found {}",
        topology.branches.len()
      );
    }

    let mut adjacency = vec![vec![]; num_nodes];
    for (e, branch) in topology.branches.iter().enumerate() {
      if branch.a >= num_nodes || branch.b >= num_nodes || branch.a == branch.b {
        return make_error!("Branch #{e} has invalid endpoints ({}, {})", branch.a, branch.b);
      }
      if !(branch.length >= 0.0) || !branch.length.is_finite() {
        return make_error!("Branch #{e} has invalid length {}", branch.length);
      }
      adjacency[branch.a].push(e);
      adjacency[branch.b].push(e);
    }

    for (node, edges) in adjacency.iter().enumerate() {
      let expected = if node < num_tips { 1 } else { 3 };
      if edges.len() != expected {
        return make_error!(
          "Node #{node} must have {expected} neighbor(s), but has {}. Only unrooted binary trees are supported.",
          edges.len()
        );
      }
    }

    let tree = Self {
      tip_names,
      branches: topology.branches.clone(),
      adjacency,
    };

    if tree.reachable_from(0).len() != num_nodes {
      return make_error!("Tree is not connected");
    }

    Ok(tree)
  }

  pub fn topology(&self) -> TreeTopology {
    TreeTopology {
      branches: self.branches.clone(),
    }
  }

  #[inline]
  pub fn tip_names(&self) -> &[String] {
    &self.tip_names
  }

  #[inline]
  pub fn num_tips(&self) -> usize {
    self.tip_names.len()
  }

  #[inline]
  pub fn num_nodes(&self) -> usize {
    self.adjacency.len()
  }

  #[inline]
  pub fn num_branches(&self) -> usize {
    self.branches.len()
  }

  #[inline]
  pub fn is_tip(&self, node: NodeId) -> bool {
    node < self.num_tips()
  }

  #[inline]
  pub fn branch(&self, edge: EdgeId) -> &Branch {
    &self.branches[edge]
  }

  #[inline]
  pub fn branches(&self) -> &[Branch] {
    &self.branches
  }

  #[inline]
  pub fn branch_length(&self, edge: EdgeId) -> f64 {
    self.branches[edge].length
  }

  #[inline]
  pub fn set_branch_length(&mut self, edge: EdgeId, length: f64) {
    self.branches[edge].length = length;
  }

  pub fn scale_branch_lengths(&mut self, factor: f64, min: f64, max: f64) {
    for branch in &mut self.branches {
      branch.length = (branch.length * factor).clamp(min, max);
    }
  }

  #[inline]
  pub fn other_end(&self, edge: EdgeId, node: NodeId) -> NodeId {
    let branch = &self.branches[edge];
    if branch.a == node {
      branch.b
    } else {
      branch.a
    }
  }

  /// Incident branches and the nodes on their other end
  pub fn neighbors(&self, node: NodeId) -> impl Iterator<Item = (EdgeId, NodeId)> + '_ {
    self.adjacency[node].iter().map(move |&e| (e, self.other_end(e, node)))
  }

  /// Neighbors of `node` except the one across `from`
  pub fn children(&self, node: NodeId, from: EdgeId) -> impl Iterator<Item = (EdgeId, NodeId)> + '_ {
    self.neighbors(node).filter(move |&(e, _)| e != from)
  }

  /// The branch adjacent to tip 0, where the likelihood is evaluated by default
  #[inline]
  pub fn root_branch(&self) -> EdgeId {
    self.adjacency[0][0]
  }

  /// Branches in depth-first pre-order starting from the root branch, so that consecutive branches are close
  pub fn traversal_branches(&self) -> Vec<EdgeId> {
    let root = self.root_branch();
    let mut order = vec![root];
    let mut stack = vec![(self.branch(root).b, root), (self.branch(root).a, root)];
    while let Some((node, from)) = stack.pop() {
      for (e, child) in self.children(node, from).collect_vec().into_iter().rev() {
        order.push(e);
        stack.push((child, e));
      }
    }
    order
  }

  /// Tips in the subtree rooted at `node` when looking away from branch `from`
  pub fn subtree_tips(&self, node: NodeId, from: EdgeId) -> Vec<NodeId> {
    let mut tips = vec![];
    let mut stack = vec![(node, from)];
    while let Some((node, from)) = stack.pop() {
      if self.is_tip(node) {
        tips.push(node);
      }
      for (e, child) in self.children(node, from) {
        stack.push((child, e));
      }
    }
    tips
  }

  /// Whether branch `edge` lies inside the subtree rooted at `node` when looking away from branch `from`
  pub fn subtree_contains_branch(&self, node: NodeId, from: EdgeId, edge: EdgeId) -> bool {
    let mut stack = vec![(node, from)];
    while let Some((node, from)) = stack.pop() {
      for (e, child) in self.children(node, from) {
        if e == edge {
          return true;
        }
        stack.push((child, e));
      }
    }
    false
  }

  fn reachable_from(&self, start: NodeId) -> Vec<NodeId> {
    let mut visited = vec![false; self.num_nodes()];
    let mut stack = vec![start];
    let mut result = vec![];
    while let Some(node) = stack.pop() {
      if visited[node] {
        continue;
      }
      visited[node] = true;
      result.push(node);
      stack.extend(self.neighbors(node).map(|(_, n)| n));
    }
    result
  }

  /// Moves the subtree hanging from `subtree_node` off branch `prune_edge` onto branch `target`.
  ///
  /// The attachment node `p` (other end of `prune_edge`) is removed by merging its two remaining branches into one,
  /// which keeps the id of the first of them. The freed branch id then connects `p` to one half of the split target.
  /// Both halves of the target get half of its length.
  pub fn apply_spr(&mut self, prune_edge: EdgeId, subtree_node: NodeId, target: EdgeId) -> Result<SprMove, Report> {
    let p = self.other_end(prune_edge, subtree_node);
    if self.is_tip(p) {
      return make_error!("SPR: attachment node of branch #{prune_edge} is a tip");
    }

    let (merged, x) = self.children(p, prune_edge).next().unwrap_or((prune_edge, p));
    let (freed, y) = self.children(p, prune_edge).nth(1).unwrap_or((prune_edge, p));
    if merged == prune_edge || freed == prune_edge {
      return make_error!("SPR: attachment node #{p} is not binary");
    }

    if target == merged || target == freed || target == prune_edge {
      return make_error!("SPR: branch #{target} is adjacent to the pruned subtree");
    }
    if self.subtree_contains_branch(subtree_node, prune_edge, target) {
      return make_error!("SPR: branch #{target} is inside the pruned subtree");
    }

    let Branch { a: c, b: d, length } = self.branches[target];
    let touched_nodes = [p, x, y, c, d].into_iter().unique().collect_vec();

    let snapshot = SprMove {
      pruned_node: p,
      subtree_node,
      target,
      changed_nodes: touched_nodes.clone(),
      branches: [merged, freed, target]
        .into_iter()
        .map(|e| (e, self.branches[e]))
        .collect(),
      adjacency: touched_nodes
        .iter()
        .map(|&node| (node, self.adjacency[node].clone()))
        .collect(),
    };

    // Prune: x - p - y becomes x - y over the merged branch
    let merged_length = self.branches[merged].length + self.branches[freed].length;
    self.branches[merged] = Branch {
      a: x,
      b: y,
      length: merged_length,
    };
    self.replace_adjacency(y, freed, merged);
    self.adjacency[p].retain(|&e| e == prune_edge);

    // Regraft: c - d becomes c - p - d
    self.branches[target] = Branch {
      a: c,
      b: p,
      length: length / 2.0,
    };
    self.branches[freed] = Branch {
      a: p,
      b: d,
      length: length / 2.0,
    };
    self.replace_adjacency(d, target, freed);
    self.adjacency[p].push(target);
    self.adjacency[p].push(freed);

    Ok(snapshot)
  }

  pub fn revert_spr(&mut self, spr: &SprMove) {
    for (e, branch) in &spr.branches {
      self.branches[*e] = *branch;
    }
    for (node, edges) in &spr.adjacency {
      self.adjacency[*node].clone_from(edges);
    }
  }

  /// Branches of the SPR move whose length is free after regrafting: the two halves of the target and the branch
  /// leading to the subtree
  pub fn spr_branches(&self, spr: &SprMove) -> Vec<EdgeId> {
    self.adjacency[spr.pruned_node].clone()
  }

  fn replace_adjacency(&mut self, node: NodeId, old: EdgeId, new: EdgeId) {
    for e in &mut self.adjacency[node] {
      if *e == old {
        *e = new;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::nwk::{tree_from_nwk_str, tree_to_nwk_string};
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("t{i}")).collect()
  }

  #[rstest]
  fn builds_and_traverses() -> Result<(), Report> {
    let tree = tree_from_nwk_str("((t0:0.1,t1:0.2):0.3,(t2:0.1,t3:0.4):0.1);", &names(4))?;
    assert_eq!(tree.num_branches(), 5);
    assert_eq!(tree.num_nodes(), 6);
    let order = tree.traversal_branches();
    assert_eq!(order.len(), 5);
    assert_eq!(order.iter().unique().count(), 5);
    assert_eq!(order[0], tree.root_branch());
    Ok(())
  }

  #[rstest]
  fn spr_then_revert_restores_tree() -> Result<(), Report> {
    let mut tree = tree_from_nwk_str("(((t0:0.1,t1:0.1):0.1,t2:0.1):0.1,(t3:0.1,(t4:0.1,t5:0.1):0.1):0.1);", &names(6))?;
    let before = tree.topology();

    // Move tip t1 onto the branch leading to t5
    let prune_edge = tree.neighbors(1).next().map(|(e, _)| e).unwrap_or_default();
    let target = tree.neighbors(5).next().map(|(e, _)| e).unwrap_or_default();
    let spr = tree.apply_spr(prune_edge, 1, target)?;

    let moved = tree_from_nwk_str(&tree_to_nwk_string(&tree, None)?, &names(6))?;
    assert_eq!(moved.num_branches(), 9);

    let (t5_edge, _) = tree.neighbors(5).next().unwrap_or_default();
    let t5_parent = tree.other_end(t5_edge, 5);
    assert!(tree.neighbors(t5_parent).any(|(_, n)| n == 1));

    tree.revert_spr(&spr);
    assert_eq!(tree.topology(), before);
    Ok(())
  }

  #[rstest]
  fn rejects_target_inside_subtree() -> Result<(), Report> {
    let mut tree = tree_from_nwk_str("(((t0:0.1,t1:0.1):0.1,t2:0.1):0.1,(t3:0.1,(t4:0.1,t5:0.1):0.1):0.1);", &names(6))?;
    let t4_edge = tree.neighbors(4).next().map(|(e, _)| e).unwrap_or_default();
    let parent = tree.other_end(t4_edge, 4);
    let (prune_edge, _) = tree.neighbors(parent).find(|(_, n)| !tree.is_tip(*n)).unwrap_or_default();
    assert!(tree.apply_spr(prune_edge, parent, t4_edge).is_err());
    Ok(())
  }
}
