use crate::engine::options::SearchOptions;
use crate::engine::run::EngineResult;
use crate::io::json::{json_write_file, JsonPretty};
use crate::io::nwk::{tree_to_nwk_string, write_nwk_file};
use crate::make_error;
use crate::parallel::Coordinator;
use crate::tree::tree::Tree;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::info;
use std::path::PathBuf;

/// Result files of a run, all sharing the output prefix
#[derive(Clone, Debug)]
pub struct OutputFiles {
  pub best_tree: PathBuf,
  pub ml_trees: PathBuf,
  pub best_model: PathBuf,
  pub bootstraps: PathBuf,
  pub support: PathBuf,
  pub start_trees: PathBuf,
}

impl OutputFiles {
  pub fn new(options: &SearchOptions) -> Self {
    Self {
      best_tree: options.output_path("bestTree"),
      ml_trees: options.output_path("mlTrees"),
      best_model: options.output_path("bestModel"),
      bootstraps: options.output_path("bootstraps"),
      support: options.output_path("support"),
      start_trees: options.output_path("startTree"),
    }
  }

  fn all(&self) -> [&PathBuf; 6] {
    [
      &self.best_tree,
      &self.ml_trees,
      &self.best_model,
      &self.bootstraps,
      &self.support,
      &self.start_trees,
    ]
  }

  /// Results of an earlier run are never overwritten, unless in redo mode
  pub fn check_not_existing(&self) -> Result<(), Report> {
    let existing = self.all().into_iter().filter(|path| path.exists()).collect_vec();
    if existing.is_empty() {
      return Ok(());
    }
    make_error!(
      "Result files of a previous run already exist: {}. Choose another output prefix, remove the files, or use redo mode to overwrite them.",
      existing.iter().map(|path| format!("'{}'", path.display())).join(", ")
    )
  }

  pub fn write_start_trees(&self, _coordinator: &Coordinator, trees: &[Tree]) -> Result<(), Report> {
    write_trees(&self.start_trees, trees.iter().map(|tree| (tree, None)))?;
    info!("Starting trees saved to '{}'", self.start_trees.display());
    Ok(())
  }

  pub fn write_results(&self, _coordinator: &Coordinator, result: &EngineResult) -> Result<(), Report> {
    if let Some(best) = result.best_ml_tree() {
      write_trees(&self.best_tree, [(&best.tree, None)])?;
      info!("Best ML tree saved to '{}'", self.best_tree.display());

      json_write_file(&self.best_model, &best.models, JsonPretty(true))
        .wrap_err_with(|| format!("When writing best model to '{}'", self.best_model.display()))?;
      info!("Optimized model saved to '{}'", self.best_model.display());

      if result.ml_trees.len() > 1 {
        write_trees(&self.ml_trees, result.ml_trees.iter().map(|t| (&t.tree, None)))?;
        info!("All ML trees saved to '{}'", self.ml_trees.display());
      }
    }

    if !result.bootstrap_trees.is_empty() {
      write_trees(&self.bootstraps, result.bootstrap_trees.iter().map(|t| (&t.tree, None)))?;
      info!("Bootstrap trees saved to '{}'", self.bootstraps.display());
    }

    if let (Some(best), Some(support)) = (result.best_ml_tree(), &result.support) {
      write_trees(&self.support, [(&best.tree, Some(support.as_slice()))])?;
      info!("Best ML tree with support values saved to '{}'", self.support.display());
    }

    Ok(())
  }
}

fn write_trees<'t>(
  filepath: &PathBuf,
  trees: impl IntoIterator<Item = (&'t Tree, Option<&'t [Option<f64>]>)>,
) -> Result<(), Report> {
  let nwk_strings = trees
    .into_iter()
    .map(|(tree, support)| tree_to_nwk_string(tree, support))
    .collect::<Result<Vec<_>, Report>>()?;
  write_nwk_file(filepath, &nwk_strings)
}
