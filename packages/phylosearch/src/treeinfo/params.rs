use crate::constants::{
  MAX_ALPHA, MAX_BRLEN, MAX_BRLEN_SCALER, MAX_FREE_RATE, MAX_FREQ_WEIGHT, MAX_PINV, MAX_RATE_WEIGHT, MAX_SUBST_RATE,
  MIN_ALPHA, MIN_BRLEN, MIN_BRLEN_SCALER, MIN_FREE_RATE, MIN_FREQ_WEIGHT, MIN_PINV, MIN_RATE_WEIGHT, MIN_SUBST_RATE,
  PARAM_EPSILON,
};
use crate::model::model::{Model, ParamFlags, RateHeterogeneity};
use crate::optimize::brent::minimize_scalar_brent_bounded;
use crate::treeinfo::{check_no_decrease, BrlenLinkage, TreeInfo};
use eyre::{Report, WrapErr};
use log::debug;

/// Upper bound on the passes over the coordinates of a multi-dimensional parameter class
const MAX_COORDINATE_ROUNDS: usize = 8;

/// Search domain of a scalar parameter
#[derive(Clone, Copy, Debug)]
struct Domain {
  min: f64,
  max: f64,
  log_scale: bool,
}

impl Domain {
  const fn linear(min: f64, max: f64) -> Self {
    Self {
      min,
      max,
      log_scale: false,
    }
  }

  const fn log(min: f64, max: f64) -> Self {
    Self {
      min,
      max,
      log_scale: true,
    }
  }

  fn bounds(&self) -> (f64, f64) {
    if self.log_scale {
      (self.min.ln(), self.max.ln())
    } else {
      (self.min, self.max)
    }
  }

  fn value(&self, param: f64) -> f64 {
    let value = if self.log_scale { param.exp() } else { param };
    value.clamp(self.min, self.max)
  }
}

impl TreeInfo {
  /// Optimizes the requested parameter classes in turn: substitution rates, frequencies, alpha, invariant sites, free
  /// rates and finally branch lengths. Each class is driven to convergence with the others fixed.
  pub fn optimize_parameters(
    &mut self,
    classes: ParamFlags,
    branch_lengths: bool,
    epsilon: f64,
  ) -> Result<f64, Report> {
    let mut loglh = self.loglh(true)?;

    let steps: [(&str, fn(&ParamFlags) -> bool, fn(&mut Self, usize, f64) -> Result<f64, Report>); 5] = [
      ("substitution rates", |f| f.subst_rates, Self::optimize_subst_rates),
      ("frequencies", |f| f.freqs, Self::optimize_freqs),
      ("alpha", |f| f.alpha, Self::optimize_alpha),
      ("invariant sites", |f| f.pinv, Self::optimize_pinv),
      ("free rates", |f| f.free_rates, Self::optimize_free_rates),
    ];

    for (name, is_requested, optimize) in steps {
      let mut changed = false;
      for p in 0..self.num_partitions() {
        if !is_requested(&self.param_flags(p).intersect(&classes)) {
          continue;
        }
        optimize(self, p, epsilon).wrap_err_with(|| format!("When optimizing {name} of partition #{p}"))?;
        changed = true;
      }
      if !changed {
        continue;
      }

      let new_loglh = self.loglh(true)?;
      check_no_decrease(loglh, new_loglh, name)?;
      debug!("Optimized {name}: {new_loglh:.6}");
      loglh = new_loglh;
    }

    if branch_lengths {
      loglh = self.optimize_branch_lengths(epsilon, 1)?;
    }
    Ok(loglh)
  }

  fn optimize_subst_rates(&mut self, partition: usize, epsilon: f64) -> Result<f64, Report> {
    let stage = "substitution rates";
    let groups = self.model(partition).subst_model.free_rate_groups();
    self.optimize_coordinates(partition, epsilon, stage, &groups, |ti, group| {
      ti.optimize_model_scalar(
        partition,
        stage,
        Domain::log(MIN_SUBST_RATE, MAX_SUBST_RATE),
        |model: &mut Model, x| model.set_rate_group(group, x),
      )
    })
  }

  /// Frequencies are parameterized by weights relative to the last state
  fn optimize_freqs(&mut self, partition: usize, epsilon: f64) -> Result<f64, Report> {
    let stage = "frequencies";
    let states = (0..self.model(partition).num_states() - 1).collect::<Vec<_>>();
    self.optimize_coordinates(partition, epsilon, stage, &states, |ti, state| {
      ti.optimize_model_scalar(
        partition,
        stage,
        Domain::log(MIN_FREQ_WEIGHT, MAX_FREQ_WEIGHT),
        |model: &mut Model, x| set_freq_weight(model, state, x),
      )
    })
  }

  fn optimize_alpha(&mut self, partition: usize, _epsilon: f64) -> Result<f64, Report> {
    self.optimize_model_scalar(
      partition,
      "alpha",
      Domain::log(MIN_ALPHA, MAX_ALPHA),
      |model: &mut Model, x| model.set_alpha(x),
    )
  }

  fn optimize_pinv(&mut self, partition: usize, _epsilon: f64) -> Result<f64, Report> {
    self.optimize_model_scalar(
      partition,
      "invariant sites",
      Domain::linear(MIN_PINV, MAX_PINV),
      |model: &mut Model, x| model.pinv = x,
    )
  }

  /// Rates and weights of the categories, one coordinate each. The rates are normalized afterwards, with the branch
  /// lengths compensating wherever that keeps the likelihood unchanged.
  fn optimize_free_rates(&mut self, partition: usize, epsilon: f64) -> Result<f64, Report> {
    let stage = "free rates";
    let categories = self.model(partition).num_rate_categories();
    let coordinates = (0..2 * categories).collect::<Vec<_>>();
    self.optimize_coordinates(partition, epsilon, stage, &coordinates, |ti, coordinate| {
      if coordinate < categories {
        ti.optimize_model_scalar(
          partition,
          stage,
          Domain::log(MIN_FREE_RATE, MAX_FREE_RATE),
          |model: &mut Model, x| {
            if let RateHeterogeneity::FreeRate { rates, .. } = &mut model.rate_het {
              rates[coordinate] = x;
            }
          },
        )
      } else {
        ti.optimize_model_scalar(
          partition,
          stage,
          Domain::log(MIN_RATE_WEIGHT, MAX_RATE_WEIGHT),
          |model: &mut Model, x| {
            if let RateHeterogeneity::FreeRate { weights, .. } = &mut model.rate_het {
              weights[coordinate - categories] = x;
            }
          },
        )
      }
    })?;

    self.normalize_free_rates(partition);
    if self.linkage() == BrlenLinkage::Scaled {
      self.normalize_brlen_scalers();
    }
    self.evaluate_partition(partition, stage)
  }

  fn normalize_free_rates(&mut self, partition: usize) {
    let mut model = self.model(partition).clone();
    let RateHeterogeneity::FreeRate { rates, weights } = &mut model.rate_het else {
      return;
    };

    let weight_sum: f64 = weights.iter().sum();
    weights.iter_mut().for_each(|w| *w /= weight_sum);
    let mean: f64 = rates.iter().zip(weights.iter()).map(|(r, w)| r * w).sum();

    match self.linkage() {
      BrlenLinkage::Scaled => {
        rates.iter_mut().for_each(|r| *r /= mean);
        model.brlen_scaler *= mean;
      }
      BrlenLinkage::Linked if self.num_partitions() == 1 => {
        rates.iter_mut().for_each(|r| *r /= mean);
        self.scale_branch_lengths(mean, MIN_BRLEN, MAX_BRLEN);
      }
      // Branch lengths are shared with other partitions, so the rates keep their scale
      BrlenLinkage::Linked => {}
    }
    self.replace_model(partition, model);
  }

  /// Optimizes the per-partition branch length scalers, then normalizes them
  pub(crate) fn optimize_brlen_scalers(&mut self) -> Result<f64, Report> {
    for p in 0..self.num_partitions() {
      self.optimize_model_scalar(
        p,
        "branch length scalers",
        Domain::log(MIN_BRLEN_SCALER, MAX_BRLEN_SCALER),
        |model: &mut Model, x| model.brlen_scaler = x,
      )?;
    }
    self.normalize_brlen_scalers();
    self.loglh(true)
  }

  /// Rescales the scalers to a site-weighted mean of 1 and moves their common factor into the branch lengths
  pub(crate) fn normalize_brlen_scalers(&mut self) {
    let total_sites: usize = self.partitions.iter().map(|p| p.sites).sum();
    if total_sites == 0 {
      return;
    }
    let mean = self
      .partitions
      .iter()
      .map(|p| p.sites as f64 * p.model.brlen_scaler)
      .sum::<f64>()
      / total_sites as f64;
    if !(mean > 0.0) || !mean.is_finite() {
      return;
    }

    for p in 0..self.num_partitions() {
      let mut model = self.model(p).clone();
      model.brlen_scaler = (model.brlen_scaler / mean).clamp(MIN_BRLEN_SCALER, MAX_BRLEN_SCALER);
      self.replace_model(p, model);
    }
    self.scale_branch_lengths(mean, MIN_BRLEN, MAX_BRLEN);
  }

  /// Coordinate-wise ascent over the given coordinates until a pass gains less than `epsilon`
  fn optimize_coordinates<C>(
    &mut self,
    partition: usize,
    epsilon: f64,
    stage: &str,
    coordinates: &[usize],
    coordinate: C,
  ) -> Result<f64, Report>
  where
    C: Fn(&mut Self, usize) -> Result<f64, Report>,
  {
    let mut loglh = self.evaluate_partition(partition, stage)?;
    for _ in 0..MAX_COORDINATE_ROUNDS {
      let start = loglh;
      for &c in coordinates {
        loglh = coordinate(self, c)?;
      }
      check_no_decrease(start, loglh, stage)?;
      if loglh - start < epsilon {
        break;
      }
    }
    Ok(loglh)
  }

  /// Maximizes the likelihood of one partition over one scalar model parameter. The parameter is set on a copy of the
  /// starting model, and the starting model is restored if Brent's method finds nothing better.
  fn optimize_model_scalar<S>(&mut self, partition: usize, stage: &str, domain: Domain, set: S) -> Result<f64, Report>
  where
    S: Fn(&mut Model, f64),
  {
    let saved = self.model(partition).clone();
    let start = self.evaluate_partition(partition, stage)?;

    let with_value = |value: f64| {
      let mut model = saved.clone();
      set(&mut model, value);
      model
    };

    let (best, cost) = minimize_scalar_brent_bounded(
      |param| {
        self.replace_model(partition, with_value(domain.value(param)));
        Ok(-self.evaluate_partition(partition, stage)?)
      },
      domain.bounds(),
      PARAM_EPSILON,
    )?;

    if -cost > start {
      self.replace_model(partition, with_value(domain.value(best)));
    } else {
      self.replace_model(partition, saved.clone());
    }
    let loglh = self.evaluate_partition(partition, stage)?;
    check_no_decrease(start, loglh, stage)?;
    Ok(loglh)
  }
}

/// Sets the weight of `state` relative to the weight of the last state, which is fixed to 1
fn set_freq_weight(model: &mut Model, state: usize, weight: f64) {
  let Some(&last) = model.freqs.last() else {
    return;
  };
  let mut weights = model.freqs.iter().map(|f| f / last).collect::<Vec<_>>();
  weights[state] = weight;
  let sum: f64 = weights.iter().sum();
  model.freqs = weights.into_iter().map(|w| w / sum).collect();
}
