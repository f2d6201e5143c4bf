//! Likelihood kernel interface.
//!
//! A kernel partition owns the compressed site data of one partition range and computes conditional likelihood
//! vectors (CLVs) and branch log-likelihoods on request. It has no notion of the tree: callers pass explicit update
//! operations referencing CLV slots and tips.

pub mod pruning;

use crate::alignment::state::StateSet;
use crate::model::model::{AscBias, Model};
use eyre::Report;

/// Operand of a kernel operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClvRef {
  /// Tip states of the given tip
  Tip(usize),
  /// Computed CLV in the given slot
  Slot(usize),
}

/// Compute the CLV in slot `target` from two children, each propagated along a branch of the given length
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClvOp {
  pub target: usize,
  pub left: ClvRef,
  pub left_length: f64,
  pub right: ClvRef,
  pub right_length: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PartitionSetup {
  pub num_tips: usize,
  pub num_clv_slots: usize,
  pub num_patterns: usize,
  pub num_states: usize,
  pub num_rate_categories: usize,
  pub asc_bias: AscBias,
  /// Whether this range applies the partition-wide one-time likelihood terms
  pub master: bool,
}

pub trait KernelPartition: Send {
  fn set_tip_states(&mut self, tip: usize, states: &[StateSet]) -> Result<(), Report>;

  fn set_pattern_weights(&mut self, weights: &[u32]) -> Result<(), Report>;

  fn set_model(&mut self, model: &Model) -> Result<(), Report>;

  fn update_clv(&mut self, op: &ClvOp) -> Result<(), Report>;

  /// Log-likelihood of this range, evaluated across the branch joining `a` and `b`
  fn edge_loglh(&mut self, a: ClvRef, b: ClvRef, length: f64) -> Result<f64, Report>;
}

pub trait LikelihoodKernel: Send + Sync {
  fn create_partition(&self, setup: &PartitionSetup) -> Result<Box<dyn KernelPartition>, Report>;
}
