use crate::checkpoint::state::{Checkpoint, MlTreeEntry, SearchState, TreeEntry};
use crate::io::fs::remove_file_if_exists;
use crate::io::json::{json_read_file, json_write_file_atomic, JsonPretty};
use crate::make_error;
use crate::model::model::Model;
use crate::parallel::{Coordinator, WorkerContext};
use crate::treeinfo::TreeInfo;
use eyre::{Report, WrapErr};
use log::{debug, info};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Owner of the run's checkpoint. Shared by all workers of a run; only the coordinator can persist it.
pub struct CheckpointManager {
  path: PathBuf,
  checkpoint: Mutex<Checkpoint>,
  started: Instant,
  elapsed_before: f64,
}

impl CheckpointManager {
  pub fn new(path: impl AsRef<Path>, checkpoint: Checkpoint) -> Self {
    let elapsed_before = checkpoint.elapsed_seconds;
    Self {
      path: path.as_ref().to_owned(),
      checkpoint: Mutex::new(checkpoint),
      started: Instant::now(),
      elapsed_before,
    }
  }

  /// Reads a checkpoint file. Absence of the file is not an error.
  pub fn read(path: impl AsRef<Path>) -> Result<Option<Checkpoint>, Report> {
    let path = path.as_ref();
    if !path.exists() {
      return Ok(None);
    }
    let checkpoint: Checkpoint =
      json_read_file(path).wrap_err_with(|| format!("When reading checkpoint '{}'", path.display()))?;
    Ok(Some(checkpoint))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn checkpoint(&self) -> Checkpoint {
    self.checkpoint.lock().clone()
  }

  pub fn search_state(&self) -> SearchState {
    self.checkpoint.lock().search_state.clone()
  }

  pub fn elapsed_seconds(&self) -> f64 {
    self.elapsed_before + self.started.elapsed().as_secs_f64()
  }

  /// Records the state of the current tree and persists the checkpoint. Collective.
  ///
  /// Every partition's parameters are published by the worker owning its master range. The coordinator then records
  /// the tree and search state and writes the file once all workers have published.
  pub fn update_and_write(&self, ctx: &WorkerContext, treeinfo: &TreeInfo, state: &SearchState) -> Result<(), Report> {
    {
      let mut checkpoint = self.checkpoint.lock();
      for p in 0..treeinfo.num_partitions() {
        if treeinfo.local_range(p).is_some_and(|range| range.master) {
          checkpoint.models.insert(p, treeinfo.model(p).clone());
        }
      }
      if ctx.is_coordinator() {
        checkpoint.tree = Some(treeinfo.tree().topology());
        checkpoint.search_state = state.clone();
      }
    }
    ctx.barrier();

    let result = match ctx.coordinator() {
      Some(coordinator) => self.write(&coordinator),
      None => Ok(()),
    };
    ctx.agree(result)
  }

  /// Adds a finished ML tree and resets the search state for the next one
  pub fn save_ml_tree(&self, coordinator: &Coordinator, index: usize, entry: TreeEntry) -> Result<(), Report> {
    {
      let mut checkpoint = self.checkpoint.lock();
      let models = checkpoint.models_vec();
      checkpoint.ml_trees.insert(index, MlTreeEntry { tree: entry, models });
      reset_search_state(&mut checkpoint);
    }
    self.write(coordinator)
  }

  /// Adds a finished bootstrap tree and resets the search state for the next one
  pub fn save_bs_tree(&self, coordinator: &Coordinator, index: usize, entry: TreeEntry) -> Result<(), Report> {
    {
      let mut checkpoint = self.checkpoint.lock();
      checkpoint.bs_trees.insert(index, entry);
      reset_search_state(&mut checkpoint);
    }
    self.write(coordinator)
  }

  /// Replaces the model parameters, e.g. before starting the next tree from the initial models
  pub fn set_models(&self, models: &[Model]) {
    self.checkpoint.lock().models = models.iter().cloned().enumerate().collect();
  }

  pub fn write(&self, _coordinator: &Coordinator) -> Result<(), Report> {
    let mut checkpoint = self.checkpoint.lock().clone();
    checkpoint.elapsed_seconds = self.elapsed_seconds();
    json_write_file_atomic(&self.path, &checkpoint, JsonPretty(false))
      .wrap_err_with(|| format!("When writing checkpoint '{}'", self.path.display()))?;
    debug!(
      "Checkpoint written: {:?}, cycle {}",
      checkpoint.search_state.step, checkpoint.search_state.cycle
    );
    Ok(())
  }

  pub fn remove(&self, _coordinator: &Coordinator) -> Result<(), Report> {
    remove_file_if_exists(&self.path).wrap_err("When removing checkpoint file")
  }
}

fn reset_search_state(checkpoint: &mut Checkpoint) {
  checkpoint.search_state = SearchState::default();
  checkpoint.tree = None;
}

/// Checks that a checkpoint belongs to the current alignment and models. A mismatch is fatal: the checkpoint is never
/// silently discarded.
pub fn check_resumable(checkpoint: &Checkpoint, taxon_names: &[String], models: &[Model]) -> Result<(), Report> {
  if checkpoint.taxon_names != taxon_names {
    return make_error!(
      "Checkpoint was created for a different alignment ({} taxa, current alignment has {}). Use redo mode to start over.",
      checkpoint.taxon_names.len(),
      taxon_names.len()
    );
  }
  if checkpoint.models.len() != models.len() || checkpoint.models.keys().copied().ne(0..models.len()) {
    return make_error!(
      "Checkpoint has {} partition model(s), but the alignment has {} partition(s). Use redo mode to start over.",
      checkpoint.models.len(),
      models.len()
    );
  }
  for (p, model) in models.iter().enumerate() {
    let saved = &checkpoint.models[&p];
    model
      .check_compatible(saved)
      .wrap_err_with(|| format!("When checking checkpointed model of partition #{p}"))?;
  }

  info!(
    "Resuming from checkpoint: {} ML tree(s) and {} bootstrap tree(s) done, current tree at {:?}",
    checkpoint.ml_trees.len(),
    checkpoint.bs_trees.len(),
    checkpoint.search_state.step
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::checkpoint::state::SearchStep;
  use crate::model::presets::SubstModel;
  use crate::tree::tree::TreeTopology;
  use pretty_assertions::assert_eq;
  use rstest::rstest;
  use tempfile::TempDir;

  fn names() -> Vec<String> {
    vec!["a".to_owned(), "b".to_owned(), "c".to_owned(), "d".to_owned()]
  }

  #[rstest]
  fn missing_checkpoint_means_fresh_start() -> Result<(), Report> {
    let dir = TempDir::new()?;
    assert_eq!(CheckpointManager::read(dir.path().join("run.ckp"))?, None);
    Ok(())
  }

  #[rstest]
  fn writes_and_reads_back() -> Result<(), Report> {
    let dir = TempDir::new()?;
    let path = dir.path().join("run.ckp");
    let models = vec![Model::new(SubstModel::Hky).with_gamma(4)];

    let mut checkpoint = Checkpoint::new(names(), &models);
    checkpoint.search_state.step = SearchStep::BranchLengthsOptimized;
    checkpoint.search_state.loglh = -1234.5;
    let manager = CheckpointManager::new(&path, checkpoint.clone());

    let ctx = crate::parallel::ParallelContext::new(1, 1)?;
    ctx.run(|worker| match worker.coordinator() {
      Some(coordinator) => manager.write(&coordinator),
      None => Ok(()),
    })?;

    let read = CheckpointManager::read(&path)?.unwrap_or_default();
    assert_eq!(read.search_state, checkpoint.search_state);
    assert_eq!(read.models, checkpoint.models);
    assert_eq!(read.taxon_names, names());
    Ok(())
  }

  #[rstest]
  fn saving_a_tree_resets_search_state() -> Result<(), Report> {
    let dir = TempDir::new()?;
    let models = vec![Model::new(SubstModel::Jc)];
    let mut checkpoint = Checkpoint::new(names(), &models);
    checkpoint.search_state.step = SearchStep::Done;
    let manager = CheckpointManager::new(dir.path().join("run.ckp"), checkpoint);

    let ctx = crate::parallel::ParallelContext::new(1, 1)?;
    ctx.run(|worker| match worker.coordinator() {
      Some(coordinator) => manager.save_bs_tree(
        &coordinator,
        0,
        TreeEntry {
          loglh: -10.0,
          topology: TreeTopology { branches: vec![] },
        },
      ),
      None => Ok(()),
    })?;

    let checkpoint = manager.checkpoint();
    assert_eq!(checkpoint.search_state, SearchState::default());
    assert_eq!(checkpoint.bs_trees.len(), 1);
    Ok(())
  }

  #[rstest]
  fn rejects_partition_mismatch() {
    let checkpoint = Checkpoint::new(names(), &[Model::new(SubstModel::Jc)]);
    let models = vec![Model::new(SubstModel::Jc), Model::new(SubstModel::Jc)];
    assert!(check_resumable(&checkpoint, &names(), &models).is_err());
  }

  #[rstest]
  fn rejects_incompatible_model() {
    let checkpoint = Checkpoint::new(names(), &[Model::new(SubstModel::Jc)]);
    let models = vec![Model::new(SubstModel::Gtr)];
    assert!(check_resumable(&checkpoint, &names(), &models).is_err());
  }
}
