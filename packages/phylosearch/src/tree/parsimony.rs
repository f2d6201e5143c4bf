use crate::alignment::msa::PartitionedMsa;
use crate::alignment::state::StateSet;
use crate::constants::DEFAULT_BRLEN;
use crate::make_error;
use crate::tree::tree::{Branch, Tree, TreeTopology};
use eyre::Report;
use itertools::{izip, Itertools};
use rand::seq::SliceRandom;
use rand::Rng;

/// Site patterns of all partitions side by side.
///
/// Fitch scoring looks at every pattern on its own, so partitions of different data types can share one table.
struct ParsimonyData {
  /// State sets indexed by taxon, then by pattern
  tips: Vec<Vec<StateSet>>,
  weights: Vec<u32>,
}

impl ParsimonyData {
  fn new(msa: &PartitionedMsa) -> Self {
    let tips = (0..msa.num_taxa())
      .map(|taxon| {
        msa
          .partitions
          .iter()
          .flat_map(|part| part.msa.sequences[taxon].iter().copied())
          .collect_vec()
      })
      .collect_vec();
    let weights = msa
      .partitions
      .iter()
      .flat_map(|part| part.msa.weights.iter().copied())
      .collect_vec();
    Self { tips, weights }
  }
}

#[inline]
const fn fitch_set(a: StateSet, b: StateSet) -> StateSet {
  let common = a & b;
  if common == 0 {
    a | b
  } else {
    common
  }
}

/// Fitch state sets of a node joining two subtrees, and the weighted number of changes the join costs
fn fitch(a: &[StateSet], b: &[StateSet], weights: &[u32]) -> (Vec<StateSet>, u64) {
  let mut cost = 0;
  let states = izip!(a, b, weights)
    .map(|(&x, &y, &w)| {
      if x & y == 0 {
        cost += u64::from(w);
      }
      fitch_set(x, y)
    })
    .collect_vec();
  (states, cost)
}

/// Extra cost of attaching a tip onto the branch between two subtrees with Fitch sets `a` and `b`
fn insertion_cost(a: &[StateSet], b: &[StateSet], tip: &[StateSet], weights: &[u32]) -> u64 {
  izip!(a, b, tip, weights)
    .filter(|(&x, &y, &t, _)| fitch_set(x, y) & t == 0)
    .map(|(_, _, _, &w)| u64::from(w))
    .sum()
}

/// Partially built tree: tips are numbered by taxon, inner nodes from the number of taxa on
struct PartialTree {
  branches: Vec<Branch>,
  adjacency: Vec<Vec<(usize, usize)>>,
}

impl PartialTree {
  fn new(branches: Vec<Branch>, num_nodes: usize) -> Self {
    let mut adjacency = vec![vec![]; num_nodes];
    for (edge, branch) in branches.iter().enumerate() {
      adjacency[branch.a].push((edge, branch.b));
      adjacency[branch.b].push((edge, branch.a));
    }
    Self { branches, adjacency }
  }

  fn children(&self, node: usize, from: Option<usize>) -> impl Iterator<Item = (usize, usize)> + '_ {
    self.adjacency[node].iter().filter(move |&&(edge, _)| Some(edge) != from).copied()
  }

  /// For every branch, the Fitch sets of the two subtrees it separates, with the tree hanging from tip `root`
  fn branch_sets(&self, root: usize, data: &ParsimonyData) -> Vec<(Vec<StateSet>, Vec<StateSet>)> {
    let num_nodes = self.adjacency.len();

    // Preorder, with the branch towards the root of every node
    let mut preorder = vec![];
    let mut stack = vec![(root, None)];
    while let Some((node, from)) = stack.pop() {
      preorder.push((node, from));
      for &(edge, child) in &self.adjacency[node] {
        if Some(edge) != from {
          stack.push((child, Some(edge)));
        }
      }
    }

    let mut below: Vec<Vec<StateSet>> = vec![vec![]; num_nodes];
    for &(node, from) in preorder.iter().rev() {
      below[node] = match self.children(node, from).collect_vec().as_slice() {
        [] => data.tips[node].clone(),
        [(_, left), (_, right)] => fitch(&below[*left], &below[*right], &data.weights).0,
        _ => continue,
      };
    }

    let mut above: Vec<Vec<StateSet>> = vec![vec![]; num_nodes];
    for &(node, from) in &preorder {
      let kids = self.children(node, from).map(|(_, child)| child).collect_vec();
      match (from, kids.as_slice()) {
        (None, [child]) => above[*child] = data.tips[node].clone(),
        (Some(_), [left, right]) => {
          above[*left] = fitch(&above[node], &below[*right], &data.weights).0;
          above[*right] = fitch(&above[node], &below[*left], &data.weights).0;
        }
        _ => {}
      }
    }

    let mut sets = vec![(vec![], vec![]); self.branches.len()];
    for &(node, from) in &preorder {
      if let Some(edge) = from {
        sets[edge] = (below[node].clone(), above[node].clone());
      }
    }
    sets
  }
}

/// Maximum-parsimony starting tree by stepwise addition.
///
/// Taxa are added in random order, each onto the branch where it adds the fewest Fitch changes (the first such
/// branch on ties). Returns the tree and its parsimony score.
pub fn parsimony_tree(msa: &PartitionedMsa, rng: &mut impl Rng) -> Result<(Tree, u64), Report> {
  let num_tips = msa.num_taxa();
  if num_tips < 3 {
    return make_error!("Parsimony tree requires at least 3 taxa, but found {num_tips}");
  }

  let data = ParsimonyData::new(msa);
  let weights = &data.weights;

  let mut order = (0..num_tips).collect_vec();
  order.shuffle(rng);

  let center = num_tips;
  let branches = order[..3]
    .iter()
    .map(|&tip| Branch {
      a: center,
      b: tip,
      length: DEFAULT_BRLEN,
    })
    .collect_vec();
  let (joined, first_cost) = fitch(&data.tips[order[0]], &data.tips[order[1]], weights);
  let mut score = first_cost + fitch(&joined, &data.tips[order[2]], weights).1;

  let mut tree = PartialTree::new(branches, center + 1);
  for &tip in &order[3..] {
    let sets = tree.branch_sets(order[0], &data);
    let costs = sets
      .iter()
      .map(|(below, above)| insertion_cost(below, above, &data.tips[tip], weights))
      .collect_vec();
    let Some((target, &cost)) = costs.iter().enumerate().min_by_key(|&(edge, &cost)| (cost, edge)) else {
      return make_error!("Parsimony tree has no branch to attach taxon '{}' to", msa.taxon_names[tip]);
    };
    score += cost;

    let inner = tree.adjacency.len();
    let mut branches = tree.branches;
    let Branch { b, .. } = branches[target];
    branches[target].b = inner;
    branches.push(Branch {
      a: inner,
      b,
      length: DEFAULT_BRLEN,
    });
    branches.push(Branch {
      a: inner,
      b: tip,
      length: DEFAULT_BRLEN,
    });
    tree = PartialTree::new(branches, inner + 1);
  }

  let tree = Tree::from_topology(
    msa.taxon_names.clone(),
    &TreeTopology {
      branches: tree.branches,
    },
  )?;
  Ok((tree, score))
}
