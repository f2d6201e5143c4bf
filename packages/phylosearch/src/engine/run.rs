//! Driver of a whole run: ML trees, then bootstrap replicates, then support values.
//!
//! All workers execute `run_worker` in lockstep. Trees and replicates are processed one at a time, each of them
//! distributed over all workers by site ranges.

use crate::alignment::msa::PartitionedMsa;
use crate::alignment::validate::validate_msa;
use crate::bootstrap::{BootstrapGenerator, SupportTree};
use crate::checkpoint::{check_resumable, Checkpoint, CheckpointManager, TreeEntry};
use crate::engine::options::{Command, SearchOptions, StartTreeType};
use crate::engine::output::OutputFiles;
use crate::engine::resources::check_resources;
use crate::engine::start_trees::{parsimony_trees, random_trees, read_user_trees};
use crate::kernel::LikelihoodKernel;
use crate::load_balancer::{balance, balance_weighted, Assignment};
use crate::model::model::Model;
use crate::optimizer::{Optimizer, SearchObserver, TreeKind};
use crate::parallel::{Coordinator, ParallelContext, WorkerContext};
use crate::tree::random::random_tree;
use crate::tree::tree::Tree;
use crate::treeinfo::TreeInfo;
use crate::utils::float_fmt::format_loglh;
use crate::utils::random::get_random_number_generator;
use crate::{make_error, make_internal_error};
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::info;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct TreeResult {
  pub loglh: f64,
  pub tree: Tree,
}

#[derive(Clone, Debug)]
pub struct MlTreeResult {
  pub loglh: f64,
  pub tree: Tree,
  pub models: Vec<Model>,
}

/// Everything a run produces, in tree order
#[derive(Clone, Debug, Default)]
pub struct EngineResult {
  pub ml_trees: Vec<MlTreeResult>,
  pub best_index: Option<usize>,
  pub bootstrap_trees: Vec<TreeResult>,
  /// Support of the branches of the best ML tree, indexed by branch
  pub support: Option<Vec<Option<f64>>>,
  pub elapsed_seconds: f64,
}

impl EngineResult {
  pub fn best_ml_tree(&self) -> Option<&MlTreeResult> {
    self.best_index.and_then(|index| self.ml_trees.get(index))
  }

  fn from_checkpoint(checkpoint: &Checkpoint, elapsed_seconds: f64) -> Result<Self, Report> {
    let names = &checkpoint.taxon_names;

    let ml_trees = checkpoint
      .ml_trees
      .values()
      .map(|entry| {
        Ok(MlTreeResult {
          loglh: entry.tree.loglh,
          tree: Tree::from_topology(names.clone(), &entry.tree.topology)?,
          models: entry.models.clone(),
        })
      })
      .collect::<Result<Vec<_>, Report>>()?;

    let best_index = checkpoint
      .best_ml_tree()
      .and_then(|(best, _)| checkpoint.ml_trees.keys().position(|&index| index == best));

    let bootstrap_trees = checkpoint
      .bs_trees
      .values()
      .map(|entry| {
        Ok(TreeResult {
          loglh: entry.loglh,
          tree: Tree::from_topology(names.clone(), &entry.topology)?,
        })
      })
      .collect::<Result<Vec<_>, Report>>()?;

    let mut result = Self {
      ml_trees,
      best_index,
      bootstrap_trees,
      support: None,
      elapsed_seconds,
    };

    if let Some(best) = result.best_ml_tree() {
      if !result.bootstrap_trees.is_empty() {
        let mut support = SupportTree::new(best.tree.clone());
        for bootstrap in &result.bootstrap_trees {
          support.add_bootstrap_tree(&bootstrap.tree)?;
        }
        result.support = Some(support.calc_support()?);
      }
    }

    Ok(result)
  }
}

/// Trees and random seeds of a run. Derived from the run seed alone, so a resumed run sees the same plan.
struct RunPlan {
  start_trees: Vec<Tree>,
  /// Starting tree of every bootstrap replicate
  bootstrap_tree: Tree,
  bootstrap_seeds: Vec<u64>,
}

pub struct Engine<'a> {
  msa: &'a PartitionedMsa,
  options: &'a SearchOptions,
  kernel: &'a dyn LikelihoodKernel,
  observer: Option<&'a dyn SearchObserver>,
}

impl<'a> Engine<'a> {
  pub fn new(msa: &'a PartitionedMsa, options: &'a SearchOptions, kernel: &'a dyn LikelihoodKernel) -> Self {
    Self {
      msa,
      options,
      kernel,
      observer: None,
    }
  }

  #[must_use]
  pub fn with_observer(mut self, observer: &'a dyn SearchObserver) -> Self {
    self.observer = Some(observer);
    self
  }

  pub fn run(&self) -> Result<EngineResult, Report> {
    let options = self.options;
    let msa = self.msa;

    validate_msa(msa, options.force)?;

    let outputs = OutputFiles::new(options);
    let checkpoint_path = options.checkpoint_path();
    let saved = if options.redo {
      None
    } else {
      CheckpointManager::read(&checkpoint_path)?
    };
    let resuming = saved.is_some();
    let checkpoint = match saved {
      Some(checkpoint) => {
        check_resumable(&checkpoint, &msa.taxon_names, &msa.models())?;
        checkpoint
      }
      None => {
        if !options.redo {
          outputs.check_not_existing()?;
        }
        Checkpoint::new(msa.taxon_names.clone(), &msa.models())
      }
    };

    let plan = self.plan()?;
    info!(
      "Starting {:?} run with {} worker(s): {} ML tree(s), {} bootstrap replicate(s)",
      options.command,
      options.workers,
      plan.start_trees.len(),
      plan.bootstrap_seeds.len()
    );

    let ctx = ParallelContext::new(options.workers, msa.num_partitions())?;
    let cm = CheckpointManager::new(&checkpoint_path, checkpoint);
    let optimizer = Optimizer::new(options.optimizer_options(), self.observer);

    let results = ctx.run(|worker| self.run_worker(worker, &plan, &cm, &optimizer, &outputs, resuming))?;
    let Some(result) = results.into_iter().flatten().next() else {
      return make_internal_error!("Coordinator returned no result");
    };

    info!("Elapsed time: {:.3} seconds", result.elapsed_seconds);
    Ok(result)
  }

  fn plan(&self) -> Result<RunPlan, Report> {
    let options = self.options;
    let names = &self.msa.taxon_names;
    let mut rng = get_random_number_generator(Some(options.seed));

    // Drawn first, so that the remaining draws do not depend on the command
    let bootstrap_tree = random_tree(names, &mut rng)?;

    let start_trees = match (options.command, &options.tree_file) {
      (Command::Bootstrap, _) => vec![],
      (_, Some(tree_file)) => read_user_trees(tree_file, names)?,
      (Command::Evaluate, None) => return make_error!("Evaluation requires a file with the trees to evaluate"),
      (_, None) => match options.start_tree {
        StartTreeType::Random => random_trees(names, options.num_searches, &mut rng)?,
        StartTreeType::Parsimony => parsimony_trees(self.msa, options.num_searches, &mut rng)?,
      },
    };

    let bootstrap_seeds = if options.command.has_bootstraps() {
      (0..options.num_bootstraps).map(|_| rng.gen()).collect_vec()
    } else {
      vec![]
    };

    Ok(RunPlan {
      start_trees,
      bootstrap_tree,
      bootstrap_seeds,
    })
  }

  fn run_worker(
    &self,
    worker: &WorkerContext,
    plan: &RunPlan,
    cm: &CheckpointManager,
    optimizer: &Optimizer<'_>,
    outputs: &OutputFiles,
    resuming: bool,
  ) -> Result<Option<EngineResult>, Report> {
    let command = self.options.command;
    let costs = self.msa.site_costs();

    let assignment = worker.broadcast(|| {
      let assignment = balance(&costs, worker.num_workers())?;
      info!("Data distribution: {}", assignment.stats());
      check_resources(self.msa, &assignment.stats(), self.options.force)?;
      Ok(assignment)
    })?;

    let written = match worker.coordinator() {
      Some(coordinator) if !resuming && matches!(command, Command::Search | Command::All) => {
        outputs.write_start_trees(&coordinator, &plan.start_trees)
      }
      _ => Ok(()),
    };
    worker.agree(written)?;

    let original_weights = self.msa.original_weights();
    let initial_models = self.msa.models();
    for (index, start_tree) in plan.start_trees.iter().enumerate() {
      if cm.checkpoint().ml_trees.contains_key(&index) {
        continue;
      }

      let (tree, models) = self.resume_point(cm, start_tree, &initial_models)?;
      let mut treeinfo = self.create_treeinfo(worker, tree, &models, &assignment, &original_weights)?;
      let loglh = match command {
        Command::Evaluate => optimizer.evaluate(&mut treeinfo, cm, index)?,
        _ => optimizer.optimize_topology(&mut treeinfo, cm, TreeKind::Ml, index)?,
      };
      self.finish_tree(worker, cm, TreeKind::Ml, index, &treeinfo, loglh)?;
    }

    if !plan.start_trees.is_empty() && worker.is_coordinator() {
      if let Some((index, best)) = cm.checkpoint().best_ml_tree() {
        info!("Best ML tree: #{}, logLH = {}", index + 1, format_loglh(best.tree.loglh));
      }
    }

    if !plan.bootstrap_seeds.is_empty() {
      // Replicates start from the optimized model of the best ML tree, if there is one
      let bootstrap_models = cm
        .checkpoint()
        .best_ml_tree()
        .map_or_else(|| initial_models.clone(), |(_, best)| best.models.clone());

      for (index, &seed) in plan.bootstrap_seeds.iter().enumerate() {
        if cm.checkpoint().bs_trees.contains_key(&index) {
          continue;
        }

        let replicate = BootstrapGenerator.generate(self.msa, seed);
        let assignment = worker.broadcast(|| balance_weighted(&costs, &replicate.site_weights, worker.num_workers()))?;

        let (tree, models) = self.resume_point(cm, &plan.bootstrap_tree, &bootstrap_models)?;
        let mut treeinfo = self.create_treeinfo(worker, tree, &models, &assignment, &replicate.site_weights)?;
        let loglh = optimizer.optimize_topology(&mut treeinfo, cm, TreeKind::Bootstrap, index)?;
        self.finish_tree(worker, cm, TreeKind::Bootstrap, index, &treeinfo, loglh)?;
      }
    }

    match worker.coordinator() {
      Some(coordinator) => {
        let result = self.finalize(&coordinator, cm, outputs);
        worker.agree(result).map(Some)
      }
      None => worker.agree(Ok(None)),
    }
  }

  /// Tree and models to start from: those of a partially optimized tree from the checkpoint, if there is one
  fn resume_point(
    &self,
    cm: &CheckpointManager,
    start_tree: &Tree,
    models: &[Model],
  ) -> Result<(Tree, Vec<Model>), Report> {
    let checkpoint = cm.checkpoint();
    match &checkpoint.tree {
      Some(topology) => {
        let tree = Tree::from_topology(self.msa.taxon_names.clone(), topology)
          .wrap_err("When restoring the tree from the checkpoint")?;
        Ok((tree, checkpoint.models_vec()))
      }
      None => Ok((start_tree.clone(), models.to_vec())),
    }
  }

  fn create_treeinfo(
    &self,
    worker: &WorkerContext,
    tree: Tree,
    models: &[Model],
    assignment: &Assignment,
    site_weights: &[Vec<u32>],
  ) -> Result<TreeInfo, Report> {
    TreeInfo::new(
      worker,
      tree,
      self.msa,
      models,
      assignment.worker(worker.rank()),
      site_weights,
      self.kernel,
      &self.options.treeinfo_options(),
    )
  }

  /// Stores a finished tree in the checkpoint. Collective.
  fn finish_tree(
    &self,
    worker: &WorkerContext,
    cm: &CheckpointManager,
    kind: TreeKind,
    index: usize,
    treeinfo: &TreeInfo,
    loglh: f64,
  ) -> Result<(), Report> {
    let entry = TreeEntry {
      loglh,
      topology: treeinfo.tree().topology(),
    };
    let saved = match worker.coordinator() {
      Some(coordinator) => match kind {
        TreeKind::Ml => cm.save_ml_tree(&coordinator, index, entry),
        TreeKind::Bootstrap => cm.save_bs_tree(&coordinator, index, entry),
      },
      None => Ok(()),
    };
    worker.agree(saved)?;

    if worker.is_coordinator() {
      let what = match kind {
        TreeKind::Ml => "ML tree",
        TreeKind::Bootstrap => "Bootstrap tree",
      };
      info!("{what} #{} done, logLH = {}", index + 1, format_loglh(loglh));
      if let Some(observer) = self.observer {
        observer.tree_completed(kind, index, loglh);
      }
    }
    Ok(())
  }

  /// Collects the results, writes the result files and removes the checkpoint
  fn finalize(
    &self,
    coordinator: &Coordinator,
    cm: &CheckpointManager,
    outputs: &OutputFiles,
  ) -> Result<EngineResult, Report> {
    let result = EngineResult::from_checkpoint(&cm.checkpoint(), cm.elapsed_seconds())?;
    outputs.write_results(coordinator, &result)?;
    cm.remove(coordinator)?;
    Ok(result)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::checkpoint::MlTreeEntry;
  use crate::io::nwk::tree_from_nwk_str;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn names() -> Vec<String> {
    ["A", "B", "C", "D", "E"].iter().map(|&n| n.to_owned()).collect()
  }

  fn entry(nwk: &str, loglh: f64) -> Result<TreeEntry, Report> {
    Ok(TreeEntry {
      loglh,
      topology: tree_from_nwk_str(nwk, &names())?.topology(),
    })
  }

  #[rstest]
  fn collects_results_and_support_from_checkpoint() -> Result<(), Report> {
    let mut checkpoint = Checkpoint::new(names(), &[]);
    for (index, (nwk, loglh)) in [("((A,B),C,(D,E));", -20.0), ("((A,C),B,(D,E));", -10.0)]
      .into_iter()
      .enumerate()
    {
      checkpoint.ml_trees.insert(
        index,
        MlTreeEntry {
          tree: entry(nwk, loglh)?,
          models: vec![],
        },
      );
    }
    checkpoint.bs_trees.insert(0, entry("((A,C),B,(D,E));", -11.0)?);
    checkpoint.bs_trees.insert(1, entry("((A,B),C,(D,E));", -12.0)?);

    let result = EngineResult::from_checkpoint(&checkpoint, 1.0)?;
    assert_eq!(result.best_index, Some(1));
    assert_eq!(result.bootstrap_trees.len(), 2);

    let mut support = result.support.unwrap_or_default().into_iter().flatten().collect_vec();
    support.sort_by(f64::total_cmp);
    assert_eq!(support, vec![50.0, 100.0]);
    Ok(())
  }
}
