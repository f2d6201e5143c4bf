use crate::alignment::state::StateSet;
use crate::constants::{LOG_SCALE_FACTOR, SCALE_FACTOR, SCALE_THRESHOLD};
use crate::kernel::{ClvOp, ClvRef, KernelPartition, LikelihoodKernel, PartitionSetup};
use crate::make_error;
use crate::model::model::{AscBias, Model};
use crate::model::rate_matrix::RateMatrix;
use eyre::{Report, WrapErr};
use itertools::Itertools;

/// Felsenstein pruning with per-site scaling, discrete rate categories, invariant sites and ascertainment bias
/// correction
#[derive(Clone, Copy, Debug, Default)]
pub struct PruningKernel;

impl LikelihoodKernel for PruningKernel {
  fn create_partition(&self, setup: &PartitionSetup) -> Result<Box<dyn KernelPartition>, Report> {
    Ok(Box::new(PruningPartition::new(setup.clone())?))
  }
}

struct ModelState {
  matrix: RateMatrix,
  rates: Vec<f64>,
  rate_weights: Vec<f64>,
  pinv: f64,
}

pub struct PruningPartition {
  setup: PartitionSetup,
  /// Number of site patterns plus one phantom invariant pattern per state when ascertainment bias is corrected
  num_total_patterns: usize,
  tips: Vec<Vec<StateSet>>,
  weights: Vec<u32>,
  clvs: Vec<Vec<f64>>,
  scalers: Vec<Vec<u32>>,
  model: Option<ModelState>,
}

impl PruningPartition {
  pub fn new(setup: PartitionSetup) -> Result<Self, Report> {
    if setup.num_states < 2 || setup.num_states > 32 {
      return make_error!("Unsupported number of states: {}", setup.num_states);
    }
    if setup.num_rate_categories == 0 {
      return make_error!("Number of rate categories must be positive");
    }

    let num_phantom = if setup.asc_bias == AscBias::None {
      0
    } else {
      setup.num_states
    };
    let num_total_patterns = setup.num_patterns + num_phantom;
    let clv_size = num_total_patterns * setup.num_rate_categories * setup.num_states;

    let mut tips = vec![vec![0; num_total_patterns]; setup.num_tips];
    for tip in &mut tips {
      for (x, state) in tip[setup.num_patterns..].iter_mut().enumerate() {
        *state = 1 << x;
      }
    }

    Ok(Self {
      num_total_patterns,
      tips,
      weights: vec![1; setup.num_patterns],
      clvs: vec![vec![0.0; clv_size]; setup.num_clv_slots],
      scalers: vec![vec![0; num_total_patterns]; setup.num_clv_slots],
      model: None,
      setup,
    })
  }

  fn model(&self) -> Result<&ModelState, Report> {
    self
      .model
      .as_ref()
      .ok_or_else(|| eyre::eyre!("Model parameters are not set for this partition"))
  }

  fn check_ref(&self, clv: ClvRef) -> Result<(), Report> {
    match clv {
      ClvRef::Tip(tip) if tip < self.setup.num_tips => Ok(()),
      ClvRef::Slot(slot) if slot < self.setup.num_clv_slots => Ok(()),
      _ => make_error!("Invalid CLV reference: {clv:?}"),
    }
  }

  /// Transition matrices (row-major) for every rate category
  fn pmatrices(&self, length: f64) -> Result<Vec<Vec<f64>>, Report> {
    let model = self.model()?;
    Ok(
      model
        .rates
        .iter()
        .map(|rate| model.matrix.transition_matrix(length * rate).iter().copied().collect_vec())
        .collect_vec(),
    )
  }

  /// Writes `sum_y P[x][y] * child[y]` for every state `x` of one pattern and category into `out`
  fn propagate(&self, child: ClvRef, pattern: usize, cat: usize, p: &[f64], out: &mut [f64]) {
    let n = self.setup.num_states;
    match child {
      ClvRef::Tip(tip) => {
        let set = self.tips[tip][pattern];
        for (x, value) in out.iter_mut().enumerate() {
          *value = (0..n).filter(|&y| set & (1 << y) != 0).map(|y| p[x * n + y]).sum();
        }
      }
      ClvRef::Slot(slot) => {
        let offset = (pattern * self.setup.num_rate_categories + cat) * n;
        let clv = &self.clvs[slot][offset..offset + n];
        for (x, value) in out.iter_mut().enumerate() {
          *value = (0..n).map(|y| p[x * n + y] * clv[y]).sum();
        }
      }
    }
  }

  fn scaler(&self, clv: ClvRef, pattern: usize) -> u32 {
    match clv {
      ClvRef::Tip(_) => 0,
      ClvRef::Slot(slot) => self.scalers[slot][pattern],
    }
  }

  /// Variable-site log-likelihood of every pattern (phantom patterns included)
  fn pattern_loglh(&self, a: ClvRef, b: ClvRef, length: f64) -> Result<Vec<f64>, Report> {
    let model = self.model()?;
    let n = self.setup.num_states;
    let cats = self.setup.num_rate_categories;
    let pmatrices = self.pmatrices(length)?;
    let pi = &model.matrix.pi;

    let mut lower = vec![0.0; n];
    let mut upper = vec![0.0; n];
    let mut result = Vec::with_capacity(self.num_total_patterns);

    for pattern in 0..self.num_total_patterns {
      let mut site = 0.0;
      for cat in 0..cats {
        self.clv_values(a, pattern, cat, &mut upper);
        self.propagate(b, pattern, cat, &pmatrices[cat], &mut lower);
        let cat_lh: f64 = (0..n).map(|x| pi[x] * upper[x] * lower[x]).sum();
        site += model.rate_weights[cat] * cat_lh;
      }
      let scale = self.scaler(a, pattern) + self.scaler(b, pattern);
      result.push(site.ln() - f64::from(scale) * LOG_SCALE_FACTOR);
    }

    Ok(result)
  }

  /// CLV entries of one pattern and category, without propagation along a branch
  fn clv_values(&self, clv: ClvRef, pattern: usize, cat: usize, out: &mut [f64]) {
    let n = self.setup.num_states;
    match clv {
      ClvRef::Tip(tip) => {
        let set = self.tips[tip][pattern];
        for (x, value) in out.iter_mut().enumerate() {
          *value = if set & (1 << x) != 0 { 1.0 } else { 0.0 };
        }
      }
      ClvRef::Slot(slot) => {
        let offset = (pattern * self.setup.num_rate_categories + cat) * n;
        out.copy_from_slice(&self.clvs[slot][offset..offset + n]);
      }
    }
  }

  /// Intersection of the tip state sets of a pattern: non-empty for sites compatible with being invariant
  fn invariant_states(&self, pattern: usize) -> StateSet {
    let all = (1 << self.setup.num_states) - 1;
    self.tips.iter().fold(all, |acc, tip| acc & tip[pattern])
  }
}

impl KernelPartition for PruningPartition {
  fn set_tip_states(&mut self, tip: usize, states: &[StateSet]) -> Result<(), Report> {
    if tip >= self.setup.num_tips {
      return make_error!("Invalid tip index {tip}");
    }
    if states.len() != self.setup.num_patterns {
      return make_error!(
        "Expected {} tip states, but found {}",
        self.setup.num_patterns,
        states.len()
      );
    }
    let all = (1 << self.setup.num_states) - 1;
    if let Some(bad) = states.iter().find(|&&s| s == 0 || s & !all != 0) {
      return make_error!("Invalid state set {bad:#b} for {} states", self.setup.num_states);
    }
    self.tips[tip][..states.len()].copy_from_slice(states);
    Ok(())
  }

  fn set_pattern_weights(&mut self, weights: &[u32]) -> Result<(), Report> {
    if weights.len() != self.setup.num_patterns {
      return make_error!(
        "Expected {} pattern weights, but found {}",
        self.setup.num_patterns,
        weights.len()
      );
    }
    self.weights = weights.to_vec();
    Ok(())
  }

  fn set_model(&mut self, model: &Model) -> Result<(), Report> {
    if model.num_states() != self.setup.num_states {
      return make_error!(
        "Model '{model}' has {} states, but partition data has {}",
        model.num_states(),
        self.setup.num_states
      );
    }
    if model.num_rate_categories() != self.setup.num_rate_categories {
      return make_error!(
        "Model '{model}' has {} rate categories, but partition was created with {}",
        model.num_rate_categories(),
        self.setup.num_rate_categories
      );
    }
    if !(0.0..1.0).contains(&model.pinv) {
      return make_error!("Proportion of invariant sites must be in [0, 1), but found {}", model.pinv);
    }

    let matrix = model.rate_matrix().wrap_err("When setting model parameters")?;
    let (rates, rate_weights) = model.category_rates()?;
    self.model = Some(ModelState {
      matrix,
      rates,
      rate_weights,
      pinv: model.pinv,
    });
    Ok(())
  }

  fn update_clv(&mut self, op: &ClvOp) -> Result<(), Report> {
    self.check_ref(op.left)?;
    self.check_ref(op.right)?;
    if op.target >= self.setup.num_clv_slots || op.left == ClvRef::Slot(op.target) || op.right == ClvRef::Slot(op.target)
    {
      return make_error!("Invalid CLV update target {}", op.target);
    }

    let n = self.setup.num_states;
    let cats = self.setup.num_rate_categories;
    let left_p = self.pmatrices(op.left_length)?;
    let right_p = self.pmatrices(op.right_length)?;

    let mut target = std::mem::take(&mut self.clvs[op.target]);
    let mut target_scalers = std::mem::take(&mut self.scalers[op.target]);
    let mut left = vec![0.0; n];
    let mut right = vec![0.0; n];

    for pattern in 0..self.num_total_patterns {
      let mut max_value: f64 = 0.0;
      let start = pattern * cats * n;
      for cat in 0..cats {
        self.propagate(op.left, pattern, cat, &left_p[cat], &mut left);
        self.propagate(op.right, pattern, cat, &right_p[cat], &mut right);
        let offset = start + cat * n;
        for x in 0..n {
          let value = left[x] * right[x];
          target[offset + x] = value;
          max_value = max_value.max(value);
        }
      }

      let mut scale = self.scaler(op.left, pattern) + self.scaler(op.right, pattern);
      if max_value < SCALE_THRESHOLD && max_value > 0.0 {
        target[start..start + cats * n].iter_mut().for_each(|v| *v *= SCALE_FACTOR);
        scale += 1;
      }
      target_scalers[pattern] = scale;
    }

    self.clvs[op.target] = target;
    self.scalers[op.target] = target_scalers;
    Ok(())
  }

  fn edge_loglh(&mut self, a: ClvRef, b: ClvRef, length: f64) -> Result<f64, Report> {
    self.check_ref(a)?;
    self.check_ref(b)?;

    let pattern_lh = self.pattern_loglh(a, b, length)?;
    let model = self.model()?;
    let num_patterns = self.setup.num_patterns;

    let mut loglh = 0.0;
    for (pattern, (&lh, &w)) in pattern_lh.iter().zip(self.weights.iter()).enumerate() {
      if w == 0 {
        continue;
      }
      let site_lh = if model.pinv > 0.0 {
        let inv_states = self.invariant_states(pattern);
        let inv_freq: f64 = (0..self.setup.num_states)
          .filter(|&x| inv_states & (1 << x) != 0)
          .map(|x| model.matrix.pi[x])
          .sum();
        let var = (1.0 - model.pinv).ln() + lh;
        if inv_freq > 0.0 {
          log_add(var, (model.pinv * inv_freq).ln())
        } else {
          var
        }
      } else {
        lh
      };
      loglh += f64::from(w) * site_lh;
    }

    if self.setup.asc_bias != AscBias::None {
      let phantom_lh: f64 = pattern_lh[num_patterns..].iter().map(|lh| lh.exp()).sum();
      match &self.setup.asc_bias {
        AscBias::None => {}
        AscBias::Lewis => {
          let total_weight: f64 = self.weights.iter().map(|&w| f64::from(w)).sum();
          loglh -= total_weight * (1.0 - phantom_lh).ln();
        }
        AscBias::Felsenstein { invariant_sites } => {
          if self.setup.master {
            loglh += invariant_sites * phantom_lh.ln();
          }
        }
      }
    }

    Ok(loglh)
  }
}

/// `ln(exp(a) + exp(b))`
fn log_add(a: f64, b: f64) -> f64 {
  let (hi, lo) = if a > b { (a, b) } else { (b, a) };
  if lo == f64::NEG_INFINITY {
    hi
  } else {
    hi + (lo - hi).exp().ln_1p()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::presets::SubstModel;
  use approx::assert_ulps_eq;
  use rstest::rstest;

  fn setup(num_patterns: usize, cats: usize, asc_bias: AscBias) -> PartitionSetup {
    PartitionSetup {
      num_tips: 3,
      num_clv_slots: 2,
      num_patterns,
      num_states: 4,
      num_rate_categories: cats,
      asc_bias,
      master: true,
    }
  }

  /// JC probability of observing state `j` after time `t` starting from `i`
  fn jc(i: usize, j: usize, t: f64) -> f64 {
    let e = (-4.0 * t / 3.0).exp();
    if i == j {
      0.25 + 0.75 * e
    } else {
      0.25 - 0.25 * e
    }
  }

  #[rstest]
  fn three_taxon_jc_matches_closed_form() -> Result<(), Report> {
    let mut part = PruningPartition::new(setup(1, 1, AscBias::None))?;
    part.set_model(&Model::new(SubstModel::Jc))?;
    // A, C, A at the three tips of a star tree with branch lengths 0.1, 0.2, 0.3
    part.set_tip_states(0, &[1])?;
    part.set_tip_states(1, &[2])?;
    part.set_tip_states(2, &[1])?;
    part.update_clv(&ClvOp {
      target: 0,
      left: ClvRef::Tip(1),
      left_length: 0.2,
      right: ClvRef::Tip(2),
      right_length: 0.3,
    })?;
    let loglh = part.edge_loglh(ClvRef::Tip(0), ClvRef::Slot(0), 0.1)?;

    let expected: f64 = (0..4).map(|x| 0.25 * jc(x, 0, 0.1) * jc(x, 1, 0.2) * jc(x, 0, 0.3)).sum();
    assert_ulps_eq!(loglh, expected.ln(), epsilon = 1e-10);
    Ok(())
  }

  #[rstest]
  fn evaluation_is_independent_of_branch_direction() -> Result<(), Report> {
    let mut part = PruningPartition::new(setup(2, 4, AscBias::None))?;
    part.set_model(&Model::new(SubstModel::Jc).with_gamma(4))?;
    part.set_tip_states(0, &[1, 15])?;
    part.set_tip_states(1, &[2, 4])?;
    part.set_tip_states(2, &[1, 8])?;
    part.update_clv(&ClvOp {
      target: 0,
      left: ClvRef::Tip(1),
      left_length: 0.2,
      right: ClvRef::Tip(2),
      right_length: 0.3,
    })?;
    part.update_clv(&ClvOp {
      target: 1,
      left: ClvRef::Tip(0),
      left_length: 0.1,
      right: ClvRef::Tip(2),
      right_length: 0.3,
    })?;
    let at_tip0 = part.edge_loglh(ClvRef::Tip(0), ClvRef::Slot(0), 0.1)?;
    let at_tip1 = part.edge_loglh(ClvRef::Slot(1), ClvRef::Tip(1), 0.2)?;
    assert_ulps_eq!(at_tip0, at_tip1, epsilon = 1e-10);
    Ok(())
  }

  #[rstest]
  fn lewis_correction_lowers_likelihood_of_variable_sites() -> Result<(), Report> {
    let mut plain = PruningPartition::new(setup(1, 1, AscBias::None))?;
    let mut corrected = PruningPartition::new(setup(1, 1, AscBias::Lewis))?;
    for part in [&mut plain, &mut corrected] {
      part.set_model(&Model::new(SubstModel::Jc))?;
      part.set_tip_states(0, &[1])?;
      part.set_tip_states(1, &[2])?;
      part.set_tip_states(2, &[4])?;
      part.update_clv(&ClvOp {
        target: 0,
        left: ClvRef::Tip(1),
        left_length: 0.2,
        right: ClvRef::Tip(2),
        right_length: 0.3,
      })?;
    }
    let plain = plain.edge_loglh(ClvRef::Tip(0), ClvRef::Slot(0), 0.1)?;
    let corrected = corrected.edge_loglh(ClvRef::Tip(0), ClvRef::Slot(0), 0.1)?;
    assert!(corrected > plain);

    let p_invariant: f64 = (0..4)
      .map(|s| (0..4).map(|x| 0.25 * jc(x, s, 0.1) * jc(x, s, 0.2) * jc(x, s, 0.3)).sum::<f64>())
      .sum();
    assert_ulps_eq!(corrected, plain - (1.0 - p_invariant).ln(), epsilon = 1e-10);
    Ok(())
  }

  #[rstest]
  fn rejects_model_with_wrong_number_of_states() -> Result<(), Report> {
    let mut part = PruningPartition::new(setup(1, 1, AscBias::None))?;
    assert!(part.set_model(&Model::new(SubstModel::Mk)).is_err());
    Ok(())
  }

  #[rstest]
  fn log_add_is_stable() {
    assert_ulps_eq!(log_add(-1000.0, -1000.0), -1000.0 + 2.0_f64.ln());
    assert_ulps_eq!(log_add(f64::NEG_INFINITY, -3.0), -3.0);
  }
}
