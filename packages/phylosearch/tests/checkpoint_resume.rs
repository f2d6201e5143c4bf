mod common;

use approx::assert_abs_diff_eq;
use common::{search_options, simulated_msa, Fault, FaultyKernel, RecordingObserver};
use eyre::{eyre, Report};
use phylosearch::alignment::msa::PartitionedMsa;
use phylosearch::checkpoint::{Checkpoint, CheckpointManager, SearchStep};
use phylosearch::engine::{Command, Engine, SearchOptions};
use phylosearch::kernel::pruning::PruningKernel;
use phylosearch::load_balancer::balance;
use phylosearch::model::model::Model;
use phylosearch::optimizer::TreeKind;
use phylosearch::parallel::{is_remote_failure, ParallelContext};
use phylosearch::tree::tree::Tree;
use phylosearch::treeinfo::TreeInfo;
use phylosearch::utils::error::is_numerical_error;
use pretty_assertions::assert_eq;
use rstest::rstest;
use std::sync::Arc;
use tempfile::TempDir;

fn read_checkpoint(options: &SearchOptions) -> Result<Checkpoint, Report> {
  CheckpointManager::read(options.checkpoint_path())?.ok_or_else(|| eyre!("Checkpoint file is missing"))
}

/// Log-likelihood of the checkpointed tree and models evaluated from scratch, and the models as restored
fn restore_checkpointed(
  msa: &PartitionedMsa,
  options: &SearchOptions,
  checkpoint: &Checkpoint,
) -> Result<(f64, Vec<Model>), Report> {
  let topology = checkpoint.tree.as_ref().ok_or_else(|| eyre!("Checkpoint has no tree"))?;
  let tree = Tree::from_topology(msa.taxon_names.clone(), topology)?;
  let models = checkpoint.models_vec();
  let assignment = balance(&msa.site_costs(), 1)?;
  let weights = msa.original_weights();

  let results = ParallelContext::new(1, msa.num_partitions())?.run(|worker| {
    let mut treeinfo = TreeInfo::new(
      worker,
      tree.clone(),
      msa,
      &models,
      assignment.worker(worker.rank()),
      &weights,
      &PruningKernel,
      &options.treeinfo_options(),
    )?;
    Ok((treeinfo.loglh(false)?, treeinfo.models()))
  })?;
  Ok(results[0].clone())
}

#[rstest]
fn resumes_after_last_completed_phase() -> Result<(), Report> {
  let dir = TempDir::new()?;
  let msa = simulated_msa(100, "GTR+G")?;
  let options = search_options(dir.path(), Command::Search, 1);

  let fault = Fault::everywhere();
  let observer = RecordingObserver::arming(0, SearchStep::ModelOptimized, &fault);
  let kernel = FaultyKernel {
    fault: Arc::clone(&fault),
  };
  let report = Engine::new(&msa, &options, &kernel)
    .with_observer(&observer)
    .run()
    .err()
    .ok_or_else(|| eyre!("Run with a failing kernel succeeded"))?;
  assert!(is_numerical_error(&report));

  let checkpoint = read_checkpoint(&options)?;
  assert_eq!(checkpoint.search_state.step, SearchStep::ModelOptimized);
  assert_eq!(checkpoint.search_state.cycle, 0);
  assert!(checkpoint.ml_trees.is_empty());
  let (loglh, models) = restore_checkpointed(&msa, &options, &checkpoint)?;
  assert_abs_diff_eq!(loglh, checkpoint.search_state.loglh, epsilon = 1e-6);
  assert_eq!(models, checkpoint.models_vec());

  let observer = RecordingObserver::default();
  let result = Engine::new(&msa, &options, &PruningKernel)
    .with_observer(&observer)
    .run()?;

  let events = observer.events();
  let first = events.first().ok_or_else(|| eyre!("No phase was reported"))?;
  assert_eq!(
    (first.kind, first.tree_index, first.cycle, first.step),
    (TreeKind::Ml, 0, 0, SearchStep::BranchLengthsOptimized)
  );
  assert_eq!(events.last().map(|event| event.step), Some(SearchStep::Done));

  assert_eq!(result.ml_trees.len(), 1);
  assert!(result.ml_trees[0].loglh >= checkpoint.search_state.loglh - 1e-6);
  assert!(!options.checkpoint_path().exists());
  assert!(options.output_path("bestTree").exists());
  Ok(())
}

#[rstest]
#[case::single_worker(1, Fault::everywhere())]
#[case::failure_on_second_worker(2, Fault::non_master())]
fn numerical_failure_during_topology_search_is_fatal(
  #[case] num_workers: usize,
  #[case] fault: Arc<Fault>,
) -> Result<(), Report> {
  let dir = TempDir::new()?;
  let msa = simulated_msa(100, "GTR+G")?;
  let options = search_options(dir.path(), Command::Search, num_workers);

  let observer = RecordingObserver::arming(0, SearchStep::BranchLengthsOptimized, &fault);
  let kernel = FaultyKernel {
    fault: Arc::clone(&fault),
  };
  let report = Engine::new(&msa, &options, &kernel)
    .with_observer(&observer)
    .run()
    .err()
    .ok_or_else(|| eyre!("Run with a failing kernel succeeded"))?;

  assert!(fault.is_armed());
  assert!(is_numerical_error(&report), "{report:?}");
  assert!(!is_remote_failure(&report), "{report:?}");

  let checkpoint = read_checkpoint(&options)?;
  assert_eq!(checkpoint.search_state.step, SearchStep::BranchLengthsOptimized);
  assert_eq!(checkpoint.search_state.cycle, 0);
  assert!(checkpoint.ml_trees.is_empty());
  Ok(())
}

#[rstest]
fn rejects_checkpoint_of_different_alignment() -> Result<(), Report> {
  let dir = TempDir::new()?;
  let options = search_options(dir.path(), Command::Search, 1);

  let fault = Fault::everywhere();
  let observer = RecordingObserver::arming(0, SearchStep::ModelOptimized, &fault);
  let kernel = FaultyKernel {
    fault: Arc::clone(&fault),
  };
  let msa = simulated_msa(100, "GTR+G")?;
  assert!(Engine::new(&msa, &options, &kernel).with_observer(&observer).run().is_err());

  let other = simulated_msa(100, "JC")?;
  assert!(Engine::new(&other, &options, &PruningKernel).run().is_err());

  let redo = SearchOptions {
    redo: true,
    ..options.clone()
  };
  Engine::new(&other, &redo, &PruningKernel).run()?;
  Ok(())
}
