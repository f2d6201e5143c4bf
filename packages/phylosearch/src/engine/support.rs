use crate::bootstrap::SupportTree;
use crate::engine::output::OutputFiles;
use crate::io::nwk::{nwk_tip_names, read_nwk_str, read_nwk_strings, tree_from_nwk_str, write_nwk_file};
use crate::make_error;
use eyre::{Report, WrapErr};
use log::info;
use std::path::Path;

/// Annotates the first tree of `tree_file` with the support of its branches among the trees of `bootstraps_file`,
/// and writes it to the support output file
pub fn run_support(
  tree_file: impl AsRef<Path>,
  bootstraps_file: impl AsRef<Path>,
  outputs: &OutputFiles,
  redo: bool,
) -> Result<String, Report> {
  let (tree_file, bootstraps_file) = (tree_file.as_ref(), bootstraps_file.as_ref());

  if !redo && outputs.support.exists() {
    return make_error!(
      "Result file '{}' already exists. Choose another output prefix, remove the file, or use redo mode to overwrite it.",
      outputs.support.display()
    );
  }

  let reference_nwk = read_nwk_strings(tree_file)?;
  let taxon_names = nwk_tip_names(&read_nwk_str(&reference_nwk[0])?);
  let reference = tree_from_nwk_str(&reference_nwk[0], &taxon_names)
    .wrap_err_with(|| format!("When reading reference tree from '{}'", tree_file.display()))?;

  let bootstraps = read_nwk_strings(bootstraps_file)?;
  if bootstraps.len() < 2 {
    return make_error!(
      "At least 2 bootstrap trees are needed to compute support values, but '{}' contains {}",
      bootstraps_file.display(),
      bootstraps.len()
    );
  }

  let mut support = SupportTree::new(reference);
  for (i, nwk) in bootstraps.iter().enumerate() {
    let tree = tree_from_nwk_str(nwk, &taxon_names)
      .wrap_err_with(|| format!("When reading bootstrap tree #{} from '{}'", i + 1, bootstraps_file.display()))?;
    support.add_bootstrap_tree(&tree)?;
  }
  info!("Read {} bootstrap tree(s) from '{}'", support.num_trees(), bootstraps_file.display());

  let nwk = support.to_nwk_string()?;
  write_nwk_file(&outputs.support, &[nwk.clone()])?;
  info!("Tree with support values saved to '{}'", outputs.support.display());
  Ok(nwk)
}
