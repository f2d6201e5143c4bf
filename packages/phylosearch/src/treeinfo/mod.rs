//! Tree-search state of one worker.
//!
//! `TreeInfo` owns a tree and the kernel partitions of the site ranges assigned to this worker. Every likelihood it
//! reports is already summed over all workers, so all workers see the same values and take the same decisions during
//! optimization. Partitions owned elsewhere are still tracked (model and optimization flags) and contribute zero to the
//! local sums.

pub mod branches;
pub mod clv;
pub mod params;
pub mod spr;

use crate::alignment::msa::PartitionedMsa;
use crate::constants::LH_DECREASE_TOLERANCE;
use crate::kernel::{ClvOp, KernelPartition, LikelihoodKernel, PartitionSetup};
use crate::load_balancer::PartitionRange;
use crate::model::model::{Model, ParamFlags};
use crate::parallel::{remote_failure, WorkerContext};
use crate::tree::tree::{EdgeId, NodeId, SprMove, Tree, TreeTopology};
use crate::treeinfo::clv::{invalidate_branch, invalidate_nodes, side_ref, side_slot, DirtySet};
use crate::utils::error::{report_to_string, NumericalError};
use crate::{make_error, make_internal_error, make_numerical_error};
use eyre::{Report, WrapErr};
use log::trace;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// How branch lengths are shared between partitions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BrlenLinkage {
  /// All partitions use the same branch lengths
  #[default]
  Linked,
  /// Partitions use the same branch lengths multiplied by a per-partition scaler
  Scaled,
}

#[derive(Clone, Copy, Debug, SmartDefault, PartialEq, Eq)]
pub struct TreeInfoOptions {
  pub linkage: BrlenLinkage,

  /// Optimize the free model parameters of every partition
  #[default = true]
  pub optimize_model: bool,
}

struct LocalPartition {
  range: PartitionRange,
  kernel: Box<dyn KernelPartition>,
  /// Validity of the CLV slots, two per branch
  valid: Vec<bool>,
  /// Model parameters changed since they were last passed to the kernel
  model_stale: bool,
}

struct PartitionState {
  model: Model,
  flags: ParamFlags,
  sites: usize,
  local: Option<LocalPartition>,
}

pub struct TreeInfo {
  ctx: WorkerContext,
  tree: Tree,
  partitions: Vec<PartitionState>,
  linkage: BrlenLinkage,
  dirty: DirtySet,
  /// Failure of a local kernel call, reported at the collective check of the evaluation
  local_error: Option<Report>,
  partition_loglh: Vec<f64>,
}

impl TreeInfo {
  /// Creates kernel partitions for the ranges this worker owns.
  ///
  /// `site_weights` holds the pattern weights of every partition (original or resampled). Collective: fails on every
  /// worker if the kernel rejects the data on any of them.
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    ctx: &WorkerContext,
    tree: Tree,
    msa: &PartitionedMsa,
    models: &[Model],
    ranges: &[PartitionRange],
    site_weights: &[Vec<u32>],
    kernel: &dyn LikelihoodKernel,
    options: &TreeInfoOptions,
  ) -> Result<Self, Report> {
    if tree.tip_names() != msa.taxon_names.as_slice() {
      return make_error!("Taxa of the tree do not match the taxa of the alignment");
    }
    if models.len() != msa.num_partitions() || site_weights.len() != msa.num_partitions() {
      return make_internal_error!(
        "Expected {} models and weight vectors, but found {} and {}",
        msa.num_partitions(),
        models.len(),
        site_weights.len()
      );
    }

    let locals = ranges
      .iter()
      .map(|range| {
        create_local_partition(&tree, msa, &models[range.partition], range, &site_weights[range.partition], kernel)
          .wrap_err_with(|| format!("When creating likelihood partition '{}'", msa.partitions[range.partition].name))
      })
      .collect::<Result<Vec<_>, Report>>();
    let locals = ctx.agree(locals.map_err(|report| {
      Report::new(NumericalError::new("partition construction", report_to_string(&report)))
    }))?;

    let mut locals = locals.into_iter().map(Some).collect::<Vec<_>>();
    let partitions = models
      .iter()
      .enumerate()
      .map(|(p, model)| {
        let mut model = model.clone();
        if options.linkage == BrlenLinkage::Linked {
          model.brlen_scaler = 1.0;
        }
        let flags = if options.optimize_model {
          model.param_flags()
        } else {
          ParamFlags::none()
        };
        let local = locals
          .iter_mut()
          .find(|local| local.as_ref().is_some_and(|local| local.range.partition == p))
          .and_then(Option::take);
        PartitionState {
          model,
          flags,
          sites: site_weights[p].iter().map(|&w| w as usize).sum(),
          local,
        }
      })
      .collect::<Vec<_>>();

    trace!(
      "Worker {}: tree-search state with {} local partition range(s)",
      ctx.rank(),
      partitions.iter().filter(|p| p.local.is_some()).count()
    );

    let num_partitions = partitions.len();
    Ok(Self {
      ctx: ctx.clone(),
      tree,
      partitions,
      linkage: options.linkage,
      dirty: DirtySet {
        all: true,
        ..DirtySet::default()
      },
      local_error: None,
      partition_loglh: vec![0.0; num_partitions],
    })
  }

  #[inline]
  pub const fn tree(&self) -> &Tree {
    &self.tree
  }

  #[inline]
  pub const fn ctx(&self) -> &WorkerContext {
    &self.ctx
  }

  #[inline]
  pub fn num_partitions(&self) -> usize {
    self.partitions.len()
  }

  #[inline]
  pub const fn linkage(&self) -> BrlenLinkage {
    self.linkage
  }

  pub fn model(&self, partition: usize) -> &Model {
    &self.partitions[partition].model
  }

  pub fn models(&self) -> Vec<Model> {
    self.partitions.iter().map(|p| p.model.clone()).collect()
  }

  pub fn param_flags(&self, partition: usize) -> ParamFlags {
    self.partitions[partition].flags
  }

  /// Range of the partition owned by this worker, if any
  pub fn local_range(&self, partition: usize) -> Option<&PartitionRange> {
    self.partitions[partition].local.as_ref().map(|local| &local.range)
  }

  /// Log-likelihood of every partition as of the last evaluation
  pub fn partition_loglh(&self) -> &[f64] {
    &self.partition_loglh
  }

  /// Log-likelihood of the current tree and models.
  ///
  /// With `incremental`, only the CLVs invalidated by the changes recorded since the last evaluation are recomputed;
  /// otherwise everything is.
  pub fn loglh(&mut self, incremental: bool) -> Result<f64, Report> {
    if !incremental {
      self.dirty.all = true;
    }
    self.evaluate_at(self.tree.root_branch(), "likelihood evaluation")
  }

  /// Replaces the tree topology and branch lengths. The taxa stay the same.
  pub fn set_topology(&mut self, topology: &TreeTopology) -> Result<(), Report> {
    self.tree = Tree::from_topology(self.tree.tip_names().to_vec(), topology)?;
    self.dirty.all = true;
    Ok(())
  }

  /// Replaces the parameters of all partitions, e.g. when restoring them from a checkpoint
  pub fn set_models(&mut self, models: &[Model]) -> Result<(), Report> {
    if models.len() != self.partitions.len() {
      return make_error!("Expected {} models, but found {}", self.partitions.len(), models.len());
    }
    for (p, model) in models.iter().enumerate() {
      self.partitions[p].model.check_compatible(model)?;
      let mut model = model.clone();
      if self.linkage == BrlenLinkage::Linked {
        model.brlen_scaler = 1.0;
      }
      self.replace_model(p, model);
    }
    Ok(())
  }

  pub(crate) fn set_branch_length(&mut self, edge: EdgeId, length: f64) {
    self.tree.set_branch_length(edge, length);
    self.dirty.branches.insert(edge);
  }

  pub(crate) fn scale_branch_lengths(&mut self, factor: f64, min: f64, max: f64) {
    self.tree.scale_branch_lengths(factor, min, max);
    self.dirty.all = true;
  }

  pub(crate) fn replace_model(&mut self, partition: usize, model: Model) {
    self.partitions[partition].model = model;
    self.dirty.partitions.insert(partition);
  }

  pub(crate) fn apply_spr(&mut self, prune_edge: EdgeId, subtree_node: NodeId, target: EdgeId) -> Result<SprMove, Report> {
    self.flush_dirty();
    let spr = self.tree.apply_spr(prune_edge, subtree_node, target)?;
    self.dirty.nodes.extend(spr.changed_nodes.iter().copied());
    self.flush_dirty();
    Ok(spr)
  }

  pub(crate) fn revert_spr(&mut self, spr: &SprMove) {
    self.flush_dirty();
    self.tree.revert_spr(spr);
    self.dirty.nodes.extend(spr.changed_nodes.iter().copied());
    self.flush_dirty();
  }

  /// Applies the recorded changes to the CLV validity of the local partitions. Topology changes must be flushed on the
  /// topology they produced, so every topology mutation flushes before and after itself.
  fn flush_dirty(&mut self) {
    if self.dirty.is_empty() {
      return;
    }
    let dirty = std::mem::take(&mut self.dirty);
    for (p, partition) in self.partitions.iter_mut().enumerate() {
      let Some(local) = &mut partition.local else {
        continue;
      };
      if dirty.all || dirty.partitions.contains(&p) {
        local.valid.fill(false);
        local.model_stale = true;
        continue;
      }
      for &edge in &dirty.branches {
        invalidate_branch(&self.tree, &mut local.valid, edge);
      }
      if !dirty.nodes.is_empty() {
        invalidate_nodes(&self.tree, &mut local.valid, &dirty.nodes);
      }
    }
  }

  /// Log-likelihood summed over all workers and partitions, evaluated across the given branch
  pub(crate) fn evaluate_at(&mut self, edge: EdgeId, stage: &str) -> Result<f64, Report> {
    self.flush_dirty();

    let mut values = vec![0.0; self.partitions.len()];
    for (value, partition) in values.iter_mut().zip(self.partitions.iter_mut()) {
      *value = match local_loglh(&self.tree, partition, edge) {
        Ok(value) => value,
        Err(report) => {
          self.local_error.get_or_insert(report);
          f64::NAN
        }
      };
    }
    let local_failed = values.iter().any(|value| !value.is_finite());

    self.ctx.reduce_sum(&mut values);
    self.check_finite(&values, local_failed, stage)?;

    let total = values.iter().sum();
    self.partition_loglh = values;
    Ok(total)
  }

  /// Log-likelihood of one partition summed over all workers
  pub(crate) fn evaluate_partition(&mut self, partition: usize, stage: &str) -> Result<f64, Report> {
    self.flush_dirty();

    let edge = self.tree.root_branch();
    let local = match local_loglh(&self.tree, &mut self.partitions[partition], edge) {
      Ok(value) => value,
      Err(report) => {
        self.local_error.get_or_insert(report);
        f64::NAN
      }
    };

    let total = self.ctx.reduce_sum_scalar(local);
    self.check_finite(&[total], !local.is_finite(), stage)?;
    self.partition_loglh[partition] = total;
    Ok(total)
  }

  /// Reduced values are identical on all workers, so either all of them fail here or none does
  fn check_finite(&mut self, values: &[f64], local_failed: bool, stage: &str) -> Result<(), Report> {
    if values.iter().all(|value| value.is_finite()) {
      return Ok(());
    }
    if local_failed {
      return match self.local_error.take() {
        Some(report) => make_numerical_error!(stage, "{}", report_to_string(&report)),
        None => make_numerical_error!(stage, "log-likelihood is not finite"),
      };
    }
    Err(remote_failure(format!("Numerical error on another worker during {stage}")))
  }
}

/// Checks that an optimization step did not lose likelihood, up to rounding
pub(crate) fn check_no_decrease(before: f64, after: f64, stage: &str) -> Result<(), Report> {
  if after < before - LH_DECREASE_TOLERANCE * before.abs().max(1.0) {
    return make_numerical_error!(stage, "log-likelihood decreased from {before} to {after}");
  }
  Ok(())
}

fn create_local_partition(
  tree: &Tree,
  msa: &PartitionedMsa,
  model: &Model,
  range: &PartitionRange,
  weights: &[u32],
  kernel: &dyn LikelihoodKernel,
) -> Result<LocalPartition, Report> {
  let partition = &msa.partitions[range.partition];
  let num_patterns = partition.msa.num_patterns();
  if range.end() > num_patterns || weights.len() != num_patterns {
    return make_internal_error!(
      "Range {}..{} does not fit a partition of {num_patterns} patterns with {} weights",
      range.start,
      range.end(),
      weights.len()
    );
  }

  let setup = PartitionSetup {
    num_tips: tree.num_tips(),
    num_clv_slots: 2 * tree.num_branches(),
    num_patterns: range.length,
    num_states: model.num_states(),
    num_rate_categories: model.num_rate_categories(),
    asc_bias: model.asc_bias.clone(),
    master: range.master,
  };

  let mut kernel = kernel.create_partition(&setup)?;
  for (tip, sequence) in partition.msa.sequences.iter().enumerate() {
    kernel.set_tip_states(tip, &sequence[range.start..range.end()])?;
  }
  kernel.set_pattern_weights(&weights[range.start..range.end()])?;
  kernel.set_model(model)?;

  Ok(LocalPartition {
    range: *range,
    kernel,
    valid: vec![false; setup.num_clv_slots],
    model_stale: false,
  })
}

/// Log-likelihood of this worker's range of a partition; zero if the partition is owned elsewhere
fn local_loglh(tree: &Tree, partition: &mut PartitionState, edge: EdgeId) -> Result<f64, Report> {
  let PartitionState { model, local, .. } = partition;
  let Some(local) = local else {
    return Ok(0.0);
  };

  if local.model_stale {
    local.kernel.set_model(model)?;
    local.model_stale = false;
  }

  let scaler = model.brlen_scaler;
  let branch = *tree.branch(edge);
  update_side(tree, local, scaler, edge, branch.a)?;
  update_side(tree, local, scaler, edge, branch.b)?;
  local.kernel.edge_loglh(
    side_ref(tree, edge, branch.a),
    side_ref(tree, edge, branch.b),
    branch.length * scaler,
  )
}

/// Computes the CLV of the `node` side of `edge` and every invalid CLV below it, children first
fn update_side(
  tree: &Tree,
  local: &mut LocalPartition,
  scaler: f64,
  edge: EdgeId,
  node: NodeId,
) -> Result<(), Report> {
  let mut stack = vec![(edge, node, false)];
  while let Some((edge, node, expanded)) = stack.pop() {
    if tree.is_tip(node) {
      continue;
    }
    let slot = side_slot(tree, edge, node);
    if local.valid[slot] {
      continue;
    }

    let children = tree.children(node, edge).collect::<Vec<_>>();
    if !expanded {
      stack.push((edge, node, true));
      stack.extend(children.iter().map(|&(e, child)| (e, child, false)));
      continue;
    }

    let &[(left_edge, left), (right_edge, right)] = children.as_slice() else {
      return make_internal_error!("Node #{node} has {} children, but 2 expected", children.len());
    };
    local.kernel.update_clv(&ClvOp {
      target: slot,
      left: side_ref(tree, left_edge, left),
      left_length: tree.branch_length(left_edge) * scaler,
      right: side_ref(tree, right_edge, right),
      right_length: tree.branch_length(right_edge) * scaler,
    })?;
    local.valid[slot] = true;
  }
  Ok(())
}
