use crate::constants::DEFAULT_BRLEN;
use crate::make_error;
use crate::tree::tree::{Branch, Tree, TreeTopology};
use eyre::Report;
use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::Rng;

/// Random tree by stepwise addition: taxa are inserted in random order, each onto a uniformly chosen branch
pub fn random_tree(tip_names: &[String], rng: &mut impl Rng) -> Result<Tree, Report> {
  let num_tips = tip_names.len();
  if num_tips < 3 {
    return make_error!("Random tree requires at least 3 taxa, but found {num_tips}");
  }

  let mut order = (0..num_tips).collect_vec();
  order.shuffle(rng);

  let center = num_tips;
  let mut branches = order[..3]
    .iter()
    .map(|&tip| Branch {
      a: center,
      b: tip,
      length: DEFAULT_BRLEN,
    })
    .collect_vec();

  let mut next_inner = num_tips + 1;
  for &tip in &order[3..] {
    let target = rng.gen_range(0..branches.len());
    let Branch { b, .. } = branches[target];
    let inner = next_inner;
    next_inner += 1;

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
  }

  Tree::from_topology(tip_names.to_vec(), &TreeTopology { branches })
}
