use crate::optimizer::OptimizerOptions;
use crate::treeinfo::{BrlenLinkage, TreeInfoOptions};
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;
use std::ffi::OsString;
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
  /// ML tree search from every starting tree
  #[default]
  Search,
  /// Optimize model and branch lengths of fixed trees
  Evaluate,
  /// Bootstrap replicates only
  Bootstrap,
  /// ML search, then bootstrap replicates, then support values on the best tree
  All,
}

impl Command {
  pub const fn has_ml_trees(self) -> bool {
    matches!(self, Self::Search | Self::Evaluate | Self::All)
  }

  pub const fn has_bootstraps(self) -> bool {
    matches!(self, Self::Bootstrap | Self::All)
  }
}

/// How starting trees are built when no tree file is given
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StartTreeType {
  /// Random stepwise addition
  #[default]
  Random,
  /// Stepwise addition of taxa in random order, each at its most parsimonious position
  Parsimony,
}

#[derive(Clone, Debug, SmartDefault, PartialEq)]
pub struct SearchOptions {
  pub command: Command,

  /// Number of generated starting trees, when no tree file is given
  #[default = 1]
  pub num_searches: usize,

  pub start_tree: StartTreeType,

  #[default = 100]
  pub num_bootstraps: usize,

  #[default = 1]
  pub workers: usize,

  #[default = 1]
  pub seed: u64,

  /// Newick file with starting trees (search) or trees to evaluate
  pub tree_file: Option<PathBuf>,

  /// Common prefix of all output files, including the checkpoint
  #[default(PathBuf::from("phylosearch"))]
  pub prefix: PathBuf,

  /// Start over, ignoring the checkpoint and overwriting existing results
  pub redo: bool,

  /// Turn failed alignment and resource checks into warnings
  pub force: bool,

  pub linkage: BrlenLinkage,

  #[default = 0.1]
  pub lh_epsilon: f64,

  /// Radius of the fast SPR rounds. Zero means autodetect.
  pub spr_radius: usize,

  #[default = 1.0]
  pub spr_cutoff: f64,

  #[default = true]
  pub optimize_model: bool,

  #[default = true]
  pub optimize_brlen: bool,

  #[default = 64]
  pub max_cycles: usize,
}

impl SearchOptions {
  pub fn optimizer_options(&self) -> OptimizerOptions {
    OptimizerOptions {
      lh_epsilon: self.lh_epsilon,
      spr_radius: self.spr_radius,
      spr_cutoff: self.spr_cutoff,
      optimize_model: self.optimize_model,
      optimize_brlen: self.optimize_brlen,
      max_cycles: self.max_cycles,
    }
  }

  pub const fn treeinfo_options(&self) -> TreeInfoOptions {
    TreeInfoOptions {
      linkage: self.linkage,
      optimize_model: self.optimize_model,
    }
  }

  /// Output path made of the prefix and a suffix, e.g. `run` + `bestTree` = `run.bestTree`
  pub fn output_path(&self, suffix: &str) -> PathBuf {
    let mut path = OsString::from(self.prefix.as_os_str());
    path.push(".");
    path.push(suffix);
    PathBuf::from(path)
  }

  pub fn checkpoint_path(&self) -> PathBuf {
    self.output_path("ckp")
  }
}
