//! Bootstrap support of the branches of a reference tree

use crate::io::nwk::tree_to_nwk_string;
use crate::make_error;
use crate::tree::tree::{EdgeId, Tree};
use eyre::Report;
use itertools::Itertools;
use std::collections::HashSet;

/// Tips on one side of a branch, as a bit set. Normalized to the side without tip 0.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Split(Vec<u64>);

impl Split {
  fn new(tips: &[usize], num_tips: usize) -> Self {
    let mut bits = vec![0_u64; num_tips.div_ceil(64)];
    for &tip in tips {
      bits[tip / 64] |= 1 << (tip % 64);
    }
    let mut split = Self(bits);
    if split.contains(0) {
      split.invert(num_tips);
    }
    split
  }

  fn contains(&self, tip: usize) -> bool {
    self.0[tip / 64] & (1 << (tip % 64)) != 0
  }

  fn invert(&mut self, num_tips: usize) {
    for (i, block) in self.0.iter_mut().enumerate() {
      *block = !*block;
      let used = num_tips.saturating_sub(i * 64).min(64);
      if used < 64 {
        *block &= (1_u64 << used) - 1;
      }
    }
  }
}

/// Splits of the inner branches (both ends inner nodes) of the tree
fn inner_splits(tree: &Tree) -> Vec<(EdgeId, Split)> {
  (0..tree.num_branches())
    .filter_map(|edge| {
      let branch = tree.branch(edge);
      if tree.is_tip(branch.a) || tree.is_tip(branch.b) {
        return None;
      }
      let tips = tree.subtree_tips(branch.b, edge);
      Some((edge, Split::new(&tips, tree.num_tips())))
    })
    .collect_vec()
}

pub struct SupportTree {
  tree: Tree,
  splits: Vec<(EdgeId, Split)>,
  counts: Vec<usize>,
  num_trees: usize,
}

impl SupportTree {
  pub fn new(reference: Tree) -> Self {
    let splits = inner_splits(&reference);
    let counts = vec![0; splits.len()];
    Self {
      tree: reference,
      splits,
      counts,
      num_trees: 0,
    }
  }

  pub const fn num_trees(&self) -> usize {
    self.num_trees
  }

  pub fn add_bootstrap_tree(&mut self, tree: &Tree) -> Result<(), Report> {
    if tree.tip_names() != self.tree.tip_names() {
      return make_error!(
        "Bootstrap tree #{} is not compatible with the reference tree",
        self.num_trees + 1
      );
    }

    let splits: HashSet<Split> = inner_splits(tree).into_iter().map(|(_, split)| split).collect();
    for ((_, split), count) in self.splits.iter().zip(self.counts.iter_mut()) {
      if splits.contains(split) {
        *count += 1;
      }
    }
    self.num_trees += 1;
    Ok(())
  }

  /// Percentage of bootstrap trees containing each inner branch, indexed by branch. `None` for terminal branches.
  pub fn calc_support(&self) -> Result<Vec<Option<f64>>, Report> {
    if self.num_trees == 0 {
      return make_error!("Unable to compute support values: no bootstrap trees were added");
    }
    let mut support = vec![None; self.tree.num_branches()];
    for ((edge, _), &count) in self.splits.iter().zip(self.counts.iter()) {
      support[*edge] = Some(100.0 * count as f64 / self.num_trees as f64);
    }
    Ok(support)
  }

  /// Reference tree with support values as inner node labels
  pub fn to_nwk_string(&self) -> Result<String, Report> {
    let support = self.calc_support()?;
    tree_to_nwk_string(&self.tree, Some(&support))
  }
}
