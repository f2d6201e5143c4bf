use crate::make_error;
use eyre::Report;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
  Dna,
  Binary,
}

impl DataType {
  pub const fn num_states(self) -> usize {
    match self {
      DataType::Dna => 4,
      DataType::Binary => 2,
    }
  }

  pub fn from_name(name: &str) -> Result<Self, Report> {
    match name.trim().to_uppercase().as_str() {
      "DNA" | "NT" => Ok(DataType::Dna),
      "BIN" | "BINARY" => Ok(DataType::Binary),
      _ => make_error!("Unknown data type: '{name}'. Supported data types: DNA, BIN"),
    }
  }
}

/// Substitution model families. Each family fixes which exchangeabilities share one free parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SubstModel {
  /// Jukes-Cantor 1969: equal exchangeabilities and equal frequencies
  Jc,
  /// Kimura 1980: transitions and transversions have different rates, equal frequencies
  K80,
  /// Hasegawa-Kishino-Yano 1985: K80 exchangeabilities with unequal frequencies
  Hky,
  /// General time-reversible model
  Gtr,
  /// Binary Mk model
  Mk,
}

impl SubstModel {
  pub fn from_name(name: &str) -> Result<Self, Report> {
    match name.trim().to_uppercase().as_str() {
      "JC" | "JC69" => Ok(SubstModel::Jc),
      "K80" | "K2P" => Ok(SubstModel::K80),
      "HKY" | "HKY85" => Ok(SubstModel::Hky),
      "GTR" => Ok(SubstModel::Gtr),
      "BIN" | "MK" => Ok(SubstModel::Mk),
      _ => make_error!("Unknown substitution model: '{name}'. Supported models: JC, K80, HKY, GTR, BIN"),
    }
  }

  pub const fn data_type(self) -> DataType {
    match self {
      SubstModel::Jc | SubstModel::K80 | SubstModel::Hky | SubstModel::Gtr => DataType::Dna,
      SubstModel::Mk => DataType::Binary,
    }
  }

  /// For every exchangeability (upper triangle, row-major: AC AG AT CG CT GT) the index of its free parameter
  pub fn rate_symmetries(self) -> Vec<usize> {
    match self {
      SubstModel::Jc => vec![0; 6],
      SubstModel::K80 | SubstModel::Hky => vec![0, 1, 0, 0, 1, 0],
      SubstModel::Gtr => vec![0, 1, 2, 3, 4, 5],
      SubstModel::Mk => vec![0],
    }
  }

  /// Rate groups which can be optimized. The group of the last exchangeability is the reference fixed to 1.
  pub fn free_rate_groups(self) -> Vec<usize> {
    let sym = self.rate_symmetries();
    let reference = sym.last().copied().unwrap_or_default();
    let num_groups = sym.iter().max().map_or(0, |max| max + 1);
    (0..num_groups).filter(|&group| group != reference).collect()
  }

  pub fn equal_freqs_by_default(self) -> bool {
    matches!(self, SubstModel::Jc | SubstModel::K80 | SubstModel::Mk)
  }
}

impl Display for SubstModel {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    let name = match self {
      SubstModel::Jc => "JC",
      SubstModel::K80 => "K80",
      SubstModel::Hky => "HKY",
      SubstModel::Gtr => "GTR",
      SubstModel::Mk => "BIN",
    };
    write!(f, "{name}")
  }
}

/// Exchangeabilities with every free group set to 1
pub fn default_subst_rates(subst_model: SubstModel) -> Vec<f64> {
  vec![1.0; subst_model.rate_symmetries().len()]
}

pub fn equal_freqs(data_type: DataType) -> Vec<f64> {
  let n = data_type.num_states();
  vec![1.0 / n as f64; n]
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  #[case(SubstModel::Jc, vec![])]
  #[case(SubstModel::K80, vec![1])]
  #[case(SubstModel::Gtr, vec![0, 1, 2, 3, 4])]
  #[case(SubstModel::Mk, vec![])]
  fn free_groups_exclude_reference(#[case] model: SubstModel, #[case] expected: Vec<usize>) {
    assert_eq!(model.free_rate_groups(), expected);
  }

  #[rstest]
  fn parses_names() -> Result<(), Report> {
    assert_eq!(SubstModel::from_name("hky")?, SubstModel::Hky);
    assert_eq!(DataType::from_name("BIN")?, DataType::Binary);
    assert!(SubstModel::from_name("WAG").is_err());
    Ok(())
  }
}
