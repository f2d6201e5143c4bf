use crate::constants::DEFAULT_ALPHA;
use crate::make_error;
use crate::model::presets::{default_subst_rates, equal_freqs, DataType, SubstModel};
use crate::model::rate_matrix::RateMatrix;
use crate::model::rates::{discrete_gamma_rates, normalize_free_rates};
use eyre::Report;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// How equilibrium frequencies are obtained
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FreqMode {
  Equal,
  Empirical,
  MaxLikelihood,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RateHeterogeneity {
  None,
  Gamma { alpha: f64, categories: usize },
  FreeRate { rates: Vec<f64>, weights: Vec<f64> },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AscBias {
  None,
  Lewis,
  /// Felsenstein correction with the known number of invariant sites
  Felsenstein { invariant_sites: f64 },
}

/// Model parameter classes which are free for optimization
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamFlags {
  pub subst_rates: bool,
  pub freqs: bool,
  pub alpha: bool,
  pub pinv: bool,
  pub free_rates: bool,
}

impl ParamFlags {
  pub const fn any(&self) -> bool {
    self.subst_rates || self.freqs || self.alpha || self.pinv || self.free_rates
  }

  pub const fn none() -> Self {
    Self {
      subst_rates: false,
      freqs: false,
      alpha: false,
      pinv: false,
      free_rates: false,
    }
  }

  pub const fn all() -> Self {
    Self {
      subst_rates: true,
      freqs: true,
      alpha: true,
      pinv: true,
      free_rates: true,
    }
  }

  /// Flags set in both
  pub const fn intersect(&self, other: &Self) -> Self {
    Self {
      subst_rates: self.subst_rates && other.subst_rates,
      freqs: self.freqs && other.freqs,
      alpha: self.alpha && other.alpha,
      pinv: self.pinv && other.pinv,
      free_rates: self.free_rates && other.free_rates,
    }
  }
}

/// Evolutionary model of one partition
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Model {
  pub subst_model: SubstModel,
  pub subst_rates: Vec<f64>,
  pub freqs: Vec<f64>,
  pub freq_mode: FreqMode,
  pub rate_het: RateHeterogeneity,
  pub pinv: f64,
  pub optimize_pinv: bool,
  pub brlen_scaler: f64,
  pub asc_bias: AscBias,
}

impl Model {
  pub fn new(subst_model: SubstModel) -> Self {
    let freq_mode = if subst_model.equal_freqs_by_default() {
      FreqMode::Equal
    } else {
      FreqMode::Empirical
    };
    Self {
      subst_model,
      subst_rates: default_subst_rates(subst_model),
      freqs: equal_freqs(subst_model.data_type()),
      freq_mode,
      rate_het: RateHeterogeneity::None,
      pinv: 0.0,
      optimize_pinv: false,
      brlen_scaler: 1.0,
      asc_bias: AscBias::None,
    }
  }

  pub fn with_gamma(mut self, categories: usize) -> Self {
    self.rate_het = RateHeterogeneity::Gamma {
      alpha: DEFAULT_ALPHA,
      categories,
    };
    self
  }

  pub fn with_free_rates(mut self, categories: usize) -> Self {
    let mut rates = (1..=categories).map(|i| i as f64).collect_vec();
    let mut weights = vec![1.0; categories];
    normalize_free_rates(&mut rates, &mut weights);
    self.rate_het = RateHeterogeneity::FreeRate { rates, weights };
    self
  }

  #[inline]
  pub const fn data_type(&self) -> DataType {
    self.subst_model.data_type()
  }

  #[inline]
  pub const fn num_states(&self) -> usize {
    self.data_type().num_states()
  }

  pub fn num_rate_categories(&self) -> usize {
    match &self.rate_het {
      RateHeterogeneity::None => 1,
      RateHeterogeneity::Gamma { categories, .. } => *categories,
      RateHeterogeneity::FreeRate { rates, .. } => rates.len(),
    }
  }

  /// Relative computational cost of one alignment site under this model
  pub fn site_cost(&self) -> f64 {
    (self.num_states() * self.num_rate_categories()) as f64
  }

  pub fn alpha(&self) -> Option<f64> {
    match &self.rate_het {
      RateHeterogeneity::Gamma { alpha, .. } => Some(*alpha),
      _ => None,
    }
  }

  pub fn set_alpha(&mut self, value: f64) {
    if let RateHeterogeneity::Gamma { alpha, .. } = &mut self.rate_het {
      *alpha = value;
    }
  }

  /// Rates and weights of the rate categories. Rates are rescaled so that, together with the invariant sites, the
  /// mean substitution rate stays 1.
  pub fn category_rates(&self) -> Result<(Vec<f64>, Vec<f64>), Report> {
    let (rates, weights) = match &self.rate_het {
      RateHeterogeneity::None => (vec![1.0], vec![1.0]),
      RateHeterogeneity::Gamma { alpha, categories } => {
        let rates = discrete_gamma_rates(*alpha, *categories)?;
        (rates, vec![1.0 / *categories as f64; *categories])
      }
      RateHeterogeneity::FreeRate { rates, weights } => {
        let weight_sum: f64 = weights.iter().sum();
        (rates.clone(), weights.iter().map(|w| w / weight_sum).collect())
      }
    };
    let scale = 1.0 / (1.0 - self.pinv);
    Ok((rates.into_iter().map(|r| r * scale).collect(), weights))
  }

  pub fn rate_matrix(&self) -> Result<RateMatrix, Report> {
    RateMatrix::new(&self.subst_rates, &self.freqs)
  }

  pub fn param_flags(&self) -> ParamFlags {
    ParamFlags {
      subst_rates: !self.subst_model.free_rate_groups().is_empty(),
      freqs: self.freq_mode == FreqMode::MaxLikelihood,
      alpha: matches!(self.rate_het, RateHeterogeneity::Gamma { categories, .. } if categories > 1),
      pinv: self.optimize_pinv,
      free_rates: matches!(&self.rate_het, RateHeterogeneity::FreeRate { rates, .. } if rates.len() > 1),
    }
  }

  /// Checks that parameters restored from elsewhere (e.g. a checkpoint) describe a model of the same shape
  pub fn check_compatible(&self, other: &Model) -> Result<(), Report> {
    if self.subst_model != other.subst_model
      || self.subst_rates.len() != other.subst_rates.len()
      || self.freqs.len() != other.freqs.len()
      || self.num_rate_categories() != other.num_rate_categories()
      || std::mem::discriminant(&self.rate_het) != std::mem::discriminant(&other.rate_het)
    {
      return make_error!("Model '{self}' is not compatible with model '{other}'");
    }
    Ok(())
  }

  /// Sets the exchangeability of every member of a symmetry group
  pub fn set_rate_group(&mut self, group: usize, value: f64) {
    let sym = self.subst_model.rate_symmetries();
    for (rate, g) in self.subst_rates.iter_mut().zip(sym) {
      if g == group {
        *rate = value;
      }
    }
  }

  pub fn rate_group(&self, group: usize) -> Option<f64> {
    let sym = self.subst_model.rate_symmetries();
    self.subst_rates.iter().zip(sym).find(|(_, g)| *g == group).map(|(r, _)| *r)
  }
}

impl Display for Model {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.subst_model)?;
    match self.freq_mode {
      FreqMode::Equal if !self.subst_model.equal_freqs_by_default() => write!(f, "+FE")?,
      FreqMode::Empirical if self.subst_model.equal_freqs_by_default() => write!(f, "+FC")?,
      FreqMode::MaxLikelihood => write!(f, "+FO")?,
      _ => {}
    }
    if self.optimize_pinv || self.pinv > 0.0 {
      write!(f, "+I")?;
    }
    match &self.rate_het {
      RateHeterogeneity::None => {}
      RateHeterogeneity::Gamma { categories, .. } => write!(f, "+G{categories}")?,
      RateHeterogeneity::FreeRate { rates, .. } => write!(f, "+R{}", rates.len())?,
    }
    match &self.asc_bias {
      AscBias::None => {}
      AscBias::Lewis => write!(f, "+ASC_LEWIS")?,
      AscBias::Felsenstein { invariant_sites } => write!(f, "+ASC_FELS{{{invariant_sites}}}")?,
    }
    Ok(())
  }
}
