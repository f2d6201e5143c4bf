use crate::model::model::Model;
use crate::tree::tree::TreeTopology;
use crate::treeinfo::spr::CutoffInfo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Last completed phase of the optimization of one tree
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SearchStep {
  #[default]
  Start,
  ModelOptimized,
  BranchLengthsOptimized,
  TopologySearching,
  Done,
}

/// Stage of the topology search
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SprMode {
  /// Fast rounds with a growing radius, to find the radius for the fast rounds
  #[default]
  Autodetect,
  Fast,
  /// Thorough rounds with a sliding radius window
  Thorough,
  /// Topology search is over, only the final model optimization is left
  Finished,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SprState {
  pub mode: SprMode,
  pub radius_min: usize,
  pub radius_max: usize,
  pub fast_radius: usize,
  pub cutoff: CutoffInfo,
}

/// Progress of the tree currently being optimized
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchState {
  pub step: SearchStep,
  /// Index of the current optimization cycle
  pub cycle: usize,
  pub loglh: f64,
  pub cycle_start_loglh: f64,
  pub spr: Option<SprState>,
}

/// A finished tree
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeEntry {
  pub loglh: f64,
  pub topology: TreeTopology,
}

/// Durable snapshot of a run
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
  pub taxon_names: Vec<String>,
  /// Model parameters by partition index, as of the last update
  pub models: BTreeMap<usize, Model>,
  /// Current tree of the search in progress
  pub tree: Option<TreeTopology>,
  pub search_state: SearchState,
  /// Finished ML searches by tree index, with the models they were optimized with
  pub ml_trees: BTreeMap<usize, MlTreeEntry>,
  /// Finished bootstrap replicates by replicate index
  pub bs_trees: BTreeMap<usize, TreeEntry>,
  pub elapsed_seconds: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MlTreeEntry {
  #[serde(flatten)]
  pub tree: TreeEntry,
  pub models: Vec<Model>,
}

impl Checkpoint {
  pub fn new(taxon_names: Vec<String>, models: &[Model]) -> Self {
    Self {
      taxon_names,
      models: models.iter().cloned().enumerate().collect(),
      ..Self::default()
    }
  }

  /// Best ML tree so far. Ties go to the lower index.
  pub fn best_ml_tree(&self) -> Option<(usize, &MlTreeEntry)> {
    self
      .ml_trees
      .iter()
      .fold(None, |best: Option<(usize, &MlTreeEntry)>, (&index, entry)| match best {
        Some((_, best_entry)) if best_entry.tree.loglh >= entry.tree.loglh => best,
        _ => Some((index, entry)),
      })
  }

  pub fn models_vec(&self) -> Vec<Model> {
    self.models.values().cloned().collect()
  }
}
