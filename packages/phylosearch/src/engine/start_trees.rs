use crate::alignment::msa::PartitionedMsa;
use crate::io::nwk::{read_nwk_strings, tree_from_nwk_str};
use crate::tree::parsimony::parsimony_tree;
use crate::tree::random::random_tree;
use crate::tree::tree::Tree;
use eyre::{Report, WrapErr};
use log::{debug, info};
use rand::Rng;
use std::path::Path;

/// Reads every tree of a Newick file. Tip labels must match the alignment taxa exactly.
pub fn read_user_trees(filepath: impl AsRef<Path>, taxon_names: &[String]) -> Result<Vec<Tree>, Report> {
  let filepath = filepath.as_ref();
  let trees = read_nwk_strings(filepath)?
    .iter()
    .enumerate()
    .map(|(i, nwk)| {
      tree_from_nwk_str(nwk, taxon_names)
        .wrap_err_with(|| format!("When reading tree #{} from '{}'", i + 1, filepath.display()))
    })
    .collect::<Result<Vec<_>, Report>>()?;
  info!("Loaded {} tree(s) from '{}'", trees.len(), filepath.display());
  Ok(trees)
}

pub fn random_trees(taxon_names: &[String], count: usize, rng: &mut impl Rng) -> Result<Vec<Tree>, Report> {
  info!("Generating {count} random starting tree(s) with {} taxa", taxon_names.len());
  (0..count).map(|_| random_tree(taxon_names, rng)).collect()
}

/// Parsimony trees over all partitions at once. Each tree adds the taxa in a different random order.
pub fn parsimony_trees(msa: &PartitionedMsa, count: usize, rng: &mut impl Rng) -> Result<Vec<Tree>, Report> {
  info!("Generating {count} parsimony starting tree(s) with {} taxa", msa.num_taxa());
  (0..count)
    .map(|i| {
      let (tree, score) = parsimony_tree(msa, rng)?;
      debug!("Parsimony score of starting tree #{}: {score}", i + 1);
      Ok(tree)
    })
    .collect()
}
