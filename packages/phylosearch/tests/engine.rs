mod common;

use common::{search_options, simulated_msa, RecordingObserver};
use eyre::Report;
use itertools::Itertools;
use phylosearch::engine::{Command, Engine, SearchOptions, StartTreeType};
use phylosearch::io::nwk::{read_nwk_strings, tree_to_nwk_string};
use phylosearch::kernel::pruning::PruningKernel;
use phylosearch::optimizer::TreeKind;
use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::TempDir;

#[rstest]
fn full_run_writes_trees_bootstraps_and_support() -> Result<(), Report> {
  let dir = TempDir::new()?;
  let msa = simulated_msa(60, "JC")?;
  let options = SearchOptions {
    num_searches: 2,
    num_bootstraps: 3,
    ..search_options(dir.path(), Command::All, 2)
  };

  let observer = RecordingObserver::default();
  let result = Engine::new(&msa, &options, &PruningKernel)
    .with_observer(&observer)
    .run()?;

  assert_eq!(result.ml_trees.len(), 2);
  assert_eq!(result.bootstrap_trees.len(), 3);
  let best = result.best_ml_tree().map(|tree| tree.loglh);
  let max = result.ml_trees.iter().map(|tree| tree.loglh).fold(f64::NEG_INFINITY, f64::max);
  assert_eq!(best, Some(max));

  let support = result.support.clone().unwrap_or_default();
  assert_eq!(support.len(), msa.num_taxa() * 2 - 3);
  assert!(support.iter().flatten().all(|&value| (0.0..=100.0).contains(&value)));
  assert_eq!(support.iter().flatten().count(), msa.num_taxa() - 3);

  let completed = observer
    .trees
    .lock()
    .iter()
    .map(|&(kind, index, _)| (kind, index))
    .collect_vec();
  assert_eq!(
    completed,
    vec![
      (TreeKind::Ml, 0),
      (TreeKind::Ml, 1),
      (TreeKind::Bootstrap, 0),
      (TreeKind::Bootstrap, 1),
      (TreeKind::Bootstrap, 2),
    ]
  );

  for suffix in ["bestTree", "mlTrees", "bestModel", "bootstraps", "support", "startTree"] {
    assert!(options.output_path(suffix).exists(), "missing output '{suffix}'");
  }
  assert_eq!(read_nwk_strings(options.output_path("mlTrees"))?.len(), 2);
  assert_eq!(read_nwk_strings(options.output_path("bootstraps"))?.len(), 3);
  assert!(!options.checkpoint_path().exists());
  Ok(())
}

#[rstest]
fn same_seed_gives_same_tree() -> Result<(), Report> {
  let msa = simulated_msa(60, "GTR")?;
  let run = || -> Result<(f64, String), Report> {
    let dir = TempDir::new()?;
    let options = SearchOptions {
      seed: 17,
      ..search_options(dir.path(), Command::Search, 1)
    };
    let result = Engine::new(&msa, &options, &PruningKernel).run()?;
    let best = &result.ml_trees[0];
    Ok((best.loglh, tree_to_nwk_string(&best.tree, None)?))
  };
  assert_eq!(run()?, run()?);
  Ok(())
}

#[rstest]
fn searches_from_parsimony_starting_trees() -> Result<(), Report> {
  let msa = simulated_msa(80, "GTR+G")?;
  let run = || -> Result<(Vec<String>, Vec<f64>), Report> {
    let dir = TempDir::new()?;
    let options = SearchOptions {
      num_searches: 2,
      start_tree: StartTreeType::Parsimony,
      ..search_options(dir.path(), Command::Search, 2)
    };
    let result = Engine::new(&msa, &options, &PruningKernel).run()?;
    let start_trees = read_nwk_strings(options.output_path("startTree"))?;
    Ok((start_trees, result.ml_trees.iter().map(|tree| tree.loglh).collect()))
  };

  let (start_trees, loglh) = run()?;
  assert_eq!(start_trees.len(), 2);
  assert_eq!(loglh.len(), 2);
  assert!(loglh.iter().all(|value| value.is_finite()));
  assert_eq!(run()?, (start_trees, loglh));
  Ok(())
}

#[rstest]
fn keeps_results_of_previous_run_unless_redo() -> Result<(), Report> {
  let dir = TempDir::new()?;
  let msa = simulated_msa(40, "JC")?;
  let options = search_options(dir.path(), Command::Search, 1);

  Engine::new(&msa, &options, &PruningKernel).run()?;
  assert!(Engine::new(&msa, &options, &PruningKernel).run().is_err());

  let redo = SearchOptions {
    redo: true,
    ..options.clone()
  };
  Engine::new(&msa, &redo, &PruningKernel).run()?;
  Ok(())
}

#[rstest]
fn bootstrap_command_runs_only_replicates() -> Result<(), Report> {
  let dir = TempDir::new()?;
  let msa = simulated_msa(40, "JC")?;
  let options = SearchOptions {
    num_bootstraps: 2,
    ..search_options(dir.path(), Command::Bootstrap, 1)
  };

  let result = Engine::new(&msa, &options, &PruningKernel).run()?;
  assert!(result.ml_trees.is_empty());
  assert_eq!(result.bootstrap_trees.len(), 2);
  assert!(result.support.is_none());
  assert!(options.output_path("bootstraps").exists());
  assert!(!options.output_path("bestTree").exists());
  assert!(!options.output_path("startTree").exists());
  Ok(())
}
