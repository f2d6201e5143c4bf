use crate::constants::{DEFAULT_BRLEN, MAX_BRLEN, MIN_BRLEN};
use crate::io::file::create_file;
use crate::io::fs::read_file_to_string;
use crate::make_error;
use crate::tree::tree::{Branch, EdgeId, NodeId, Tree, TreeTopology};
use crate::utils::float_fmt::float_to_significant_digits;
use bio::io::newick;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::warn;
use petgraph::visit::EdgeRef;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// Parses a Newick string with the `bio` reader. Unnamed inner nodes get empty labels.
pub fn read_nwk_str(nwk_str: &str) -> Result<bio_types::phylogeny::Tree, Report> {
  let mut nwk_tree = newick::read(nwk_str.as_bytes()).wrap_err("When parsing Newick string")?;

  nwk_tree.g.node_weights_mut().for_each(|weight| {
    if weight == "N/A" {
      *weight = "".to_owned();
    }
  });

  Ok(nwk_tree)
}

/// Splits a file with one or more Newick trees into individual tree strings
pub fn read_nwk_strings(filepath: impl AsRef<Path>) -> Result<Vec<String>, Report> {
  let filepath = filepath.as_ref();
  let contents = read_file_to_string(filepath)?;
  let trees = contents
    .split_inclusive(';')
    .map(str::trim)
    .filter(|s| s.ends_with(';'))
    .map(ToOwned::to_owned)
    .collect_vec();
  if trees.is_empty() {
    return make_error!("No trees found in Newick file '{}'", filepath.display());
  }
  Ok(trees)
}

/// Labels of the leaves, in the order of the Newick string
pub fn nwk_tip_names(nwk_tree: &bio_types::phylogeny::Tree) -> Vec<String> {
  let g = &nwk_tree.g;
  g.node_indices()
    .filter(|&n| g.neighbors_undirected(n).count() == 1)
    .map(|n| g[n].clone())
    .collect_vec()
}

pub fn tree_from_nwk_str(nwk_str: &str, taxon_names: &[String]) -> Result<Tree, Report> {
  let nwk_tree = read_nwk_str(nwk_str)?;
  tree_from_nwk(&nwk_tree, taxon_names)
}

/// Converts a parsed Newick tree into an unrooted binary tree whose tips are numbered by the position of their
/// label in `taxon_names`.
///
/// A degree-2 root is suppressed. Multifurcations are resolved by inserting branches of minimal length. Missing or
/// zero branch lengths get the default length.
pub fn tree_from_nwk(nwk_tree: &bio_types::phylogeny::Tree, taxon_names: &[String]) -> Result<Tree, Report> {
  let g = &nwk_tree.g;

  let mut labels = g.node_indices().map(|n| g[n].clone()).collect_vec();
  let mut adjacency: Vec<Vec<(usize, f64)>> = vec![vec![]; labels.len()];
  for edge in g.edge_references() {
    // Weights are stored in single precision. Going through the shortest decimal form reads `0.3` back as `0.3`.
    let length = edge
      .weight()
      .to_string()
      .parse::<f64>()
      .wrap_err_with(|| format!("When reading the length of the branch leading to node '{}'", g[edge.target()]))?;
    if length < 0.0 {
      return make_error!(
        "Negative branch length {length} found on the branch leading to node '{}'",
        g[edge.target()]
      );
    }
    let (u, v) = (edge.source().index(), edge.target().index());
    adjacency[u].push((v, length));
    adjacency[v].push((u, length));
  }

  suppress_degree_two(&mut adjacency);
  resolve_multifurcations(&mut adjacency, &mut labels);

  let tip_index: BTreeMap<&str, usize> = taxon_names
    .iter()
    .enumerate()
    .map(|(i, name)| (name.as_str(), i))
    .collect();

  let num_tips = taxon_names.len();
  let mut node_ids = vec![None; labels.len()];
  let mut seen = vec![false; num_tips];
  let mut next_inner = num_tips;
  for (node, neighbors) in adjacency.iter().enumerate() {
    match neighbors.len() {
      0 => {}
      1 => {
        let label = labels[node].as_str();
        let Some(&tip) = tip_index.get(label) else {
          return make_error!("Taxon '{label}' from the tree is not found in the alignment");
        };
        if seen[tip] {
          return make_error!("Duplicate taxon '{label}' in the tree");
        }
        seen[tip] = true;
        node_ids[node] = Some(tip);
      }
      _ => {
        node_ids[node] = Some(next_inner);
        next_inner += 1;
      }
    }
  }

  let missing = seen
    .iter()
    .enumerate()
    .filter(|(_, &s)| !s)
    .map(|(i, _)| &taxon_names[i])
    .collect_vec();
  if !missing.is_empty() {
    return make_error!("Taxa not found in the tree: {}", missing.iter().join(", "));
  }

  let mut branches = vec![];
  let mut defaulted = 0;
  for (u, neighbors) in adjacency.iter().enumerate() {
    for &(v, length) in neighbors {
      if u < v {
        if let (Some(a), Some(b)) = (node_ids[u], node_ids[v]) {
          let length = if length > 0.0 {
            length.clamp(MIN_BRLEN, MAX_BRLEN)
          } else {
            defaulted += 1;
            DEFAULT_BRLEN
          };
          branches.push(Branch { a, b, length });
        }
      }
    }
  }
  if defaulted > 0 && defaulted < branches.len() {
    warn!("{defaulted} branch(es) without a length were set to the default length {DEFAULT_BRLEN}");
  }

  Tree::from_topology(taxon_names.to_vec(), &TreeTopology { branches })
}

fn suppress_degree_two(adjacency: &mut [Vec<(usize, f64)>]) {
  for v in 0..adjacency.len() {
    if adjacency[v].len() != 2 {
      continue;
    }
    let (u, lu) = adjacency[v][0];
    let (w, lw) = adjacency[v][1];
    for (from, to) in [(u, w), (w, u)] {
      for entry in &mut adjacency[from] {
        if entry.0 == v {
          *entry = (to, lu + lw);
        }
      }
    }
    adjacency[v].clear();
  }
}

fn resolve_multifurcations(adjacency: &mut Vec<Vec<(usize, f64)>>, labels: &mut Vec<String>) {
  let mut v = 0;
  while v < adjacency.len() {
    if adjacency[v].len() > 3 {
      let extra = adjacency[v].split_off(2);
      let v2 = adjacency.len();
      labels.push(String::new());
      for &(n, _) in &extra {
        for entry in &mut adjacency[n] {
          if entry.0 == v {
            entry.0 = v2;
          }
        }
      }
      let mut v2_neighbors = extra;
      v2_neighbors.push((v, MIN_BRLEN));
      adjacency[v].push((v2, MIN_BRLEN));
      adjacency.push(v2_neighbors);
    }
    v += 1;
  }
}

fn format_length(length: f64) -> String {
  if !length.is_finite() {
    warn!("When writing Newick: branch length is invalid: '{length}'");
  }
  float_to_significant_digits(length, 8)
}

/// Newick string of the tree, rooted at the inner node next to tip 0. If `support` is given, inner nodes are labelled
/// with the value of the branch leading to them.
pub fn tree_to_nwk_string(tree: &Tree, support: Option<&[Option<f64>]>) -> Result<String, Report> {
  let mut buf = vec![];
  write_nwk_writer(&mut buf, tree, support)?;
  Ok(String::from_utf8(buf)?)
}

pub fn write_nwk_writer(writer: &mut impl Write, tree: &Tree, support: Option<&[Option<f64>]>) -> Result<(), Report> {
  let root = tree.other_end(tree.root_branch(), 0);
  let min_tips = min_tip_below(tree, root);

  let mut stack: Vec<(NodeId, Option<EdgeId>, usize)> = vec![(root, None, 0)];
  while let Some((node, edge, child_visit)) = stack.pop() {
    let children = tree
      .neighbors(node)
      .filter(|(e, _)| Some(*e) != edge)
      .sorted_by_key(|&(_, child)| min_tips[child])
      .collect_vec();

    if child_visit < children.len() {
      stack.push((node, edge, child_visit + 1));

      if child_visit == 0 {
        write!(writer, "(")?;
      } else {
        write!(writer, ",")?;
      }

      let (child_edge, child) = children[child_visit];
      stack.push((child, Some(child_edge), 0));
    } else {
      if child_visit > 0 {
        write!(writer, ")")?;
      }

      if tree.is_tip(node) {
        write!(writer, "{}", tree.tip_names()[node])?;
      } else if let (Some(support), Some(edge)) = (support, edge) {
        if let Some(value) = support.get(edge).copied().flatten() {
          write!(writer, "{}", value.round())?;
        }
      }

      if let Some(edge) = edge {
        write!(writer, ":{}", format_length(tree.branch_length(edge)))?;
      }
    }
  }

  write!(writer, ";")?;

  Ok(())
}

/// Smallest tip id in the subtree of every node, with the tree hanging from `root`. Used to order children.
fn min_tip_below(tree: &Tree, root: NodeId) -> Vec<usize> {
  let mut order = vec![];
  let mut stack: Vec<(NodeId, Option<EdgeId>)> = vec![(root, None)];
  let mut parent = vec![None; tree.num_nodes()];
  while let Some((node, from)) = stack.pop() {
    order.push(node);
    for (e, child) in tree.neighbors(node) {
      if Some(e) != from {
        parent[child] = Some(node);
        stack.push((child, Some(e)));
      }
    }
  }

  let mut min_tips = (0..tree.num_nodes())
    .map(|node| if tree.is_tip(node) { node } else { usize::MAX })
    .collect_vec();
  for &node in order.iter().rev() {
    if let Some(p) = parent[node] {
      min_tips[p] = min_tips[p].min(min_tips[node]);
    }
  }
  min_tips
}

pub fn write_nwk_file(filepath: impl AsRef<Path>, nwk_strings: &[String]) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  let mut f = create_file(filepath)?;
  for nwk in nwk_strings {
    writeln!(f, "{nwk}").wrap_err_with(|| format!("When writing Newick file '{}'", filepath.display()))?;
  }
  f.flush()?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn names(names: &[&str]) -> Vec<String> {
    names.iter().map(|&n| n.to_owned()).collect()
  }

  #[rstest]
  fn round_trips_unrooted_tree() -> Result<(), Report> {
    let taxa = names(&["A", "B", "C", "D"]);
    let tree = tree_from_nwk_str("(A:0.1,B:0.2,(C:0.3,D:0.4):0.05);", &taxa)?;
    let output = tree_to_nwk_string(&tree, None)?;
    assert_eq!(output, "(A:0.1,B:0.2,(C:0.3,D:0.4):0.05);");
    Ok(())
  }

  #[rstest]
  fn reads_branch_lengths_in_double_precision() -> Result<(), Report> {
    let taxa = names(&["A", "B", "C", "D"]);
    let tree = tree_from_nwk_str("(A:0.1,B:0.2,(C:0.3,D:0.4):0.05);", &taxa)?;
    let mut lengths = tree.branches().iter().map(|b| b.length).collect_vec();
    lengths.sort_by(f64::total_cmp);
    assert_eq!(lengths, vec![0.05, 0.1, 0.2, 0.3, 0.4]);
    Ok(())
  }

  #[rstest]
  fn suppresses_root_and_defaults_missing_lengths() -> Result<(), Report> {
    let taxa = names(&["A", "B", "C", "D"]);
    let tree = tree_from_nwk_str("((A,B),(C,D));", &taxa)?;
    assert_eq!(tree.num_branches(), 5);
    assert!(tree.branches().iter().all(|b| b.length == DEFAULT_BRLEN));
    Ok(())
  }

  #[rstest]
  fn resolves_multifurcation() -> Result<(), Report> {
    let taxa = names(&["A", "B", "C", "D", "E"]);
    let tree = tree_from_nwk_str("(A:1,B:1,C:1,D:1,E:1);", &taxa)?;
    assert_eq!(tree.num_branches(), 7);
    Ok(())
  }

  #[rstest]
  #[case("(A:0.1,B:0.2,(C:0.3,X:0.4):0.05);")]
  #[case("(A:0.1,B:0.2,(C:0.3,A:0.4):0.05);")]
  #[case("(A:0.1,B:0.2,C:0.3);")]
  #[case("(A:0.1,B:-0.2,(C:0.3,D:0.4):0.05);")]
  fn rejects_mismatched_trees(#[case] nwk: &str) {
    let taxa = names(&["A", "B", "C", "D"]);
    assert!(tree_from_nwk_str(nwk, &taxa).is_err());
  }

  #[rstest]
  fn writes_support_labels() -> Result<(), Report> {
    let taxa = names(&["A", "B", "C", "D"]);
    let tree = tree_from_nwk_str("(A:0.1,B:0.2,(C:0.3,D:0.4):0.05);", &taxa)?;
    let support = (0..tree.num_branches())
      .map(|e| {
        let branch = tree.branch(e);
        (!tree.is_tip(branch.a) && !tree.is_tip(branch.b)).then_some(87.0)
      })
      .collect_vec();
    let output = tree_to_nwk_string(&tree, Some(&support))?;
    assert_eq!(output, "(A:0.1,B:0.2,(C:0.3,D:0.4)87:0.05);");
    Ok(())
  }
}
