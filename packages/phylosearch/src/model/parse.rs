use crate::make_error;
use crate::model::model::{AscBias, FreqMode, Model};
use crate::model::presets::SubstModel;
use eyre::{Report, WrapErr};

const DEFAULT_CATEGORIES: usize = 4;

/// Parses a model string such as `GTR+G4+FO`, `HKY+I+G`, `BIN+ASC_LEWIS` or `JC+ASC_FELS{100}`
pub fn parse_model(model_str: &str) -> Result<Model, Report> {
  parse_model_impl(model_str).wrap_err_with(|| format!("When parsing model string '{model_str}'"))
}

fn parse_model_impl(model_str: &str) -> Result<Model, Report> {
  let mut tokens = model_str.trim().split('+');
  let name = tokens.next().unwrap_or_default();
  let mut model = Model::new(SubstModel::from_name(name)?);

  for token in tokens {
    let token = token.trim().to_uppercase();
    if let Some(w) = token.strip_prefix("ASC_FELS") {
      let invariant_sites = parse_braced_f64(w)?;
      model.asc_bias = AscBias::Felsenstein { invariant_sites };
    } else if token == "ASC_LEWIS" {
      model.asc_bias = AscBias::Lewis;
    } else if token == "FC" {
      model.freq_mode = FreqMode::Empirical;
    } else if token == "FO" {
      model.freq_mode = FreqMode::MaxLikelihood;
    } else if token == "FE" {
      model.freq_mode = FreqMode::Equal;
    } else if token == "I" || token == "IO" {
      model.optimize_pinv = true;
    } else if let Some(cats) = token.strip_prefix('G') {
      model = model.with_gamma(parse_categories(cats)?);
    } else if let Some(cats) = token.strip_prefix('R') {
      model = model.with_free_rates(parse_categories(cats)?);
    } else {
      return make_error!("Unknown model component: '+{token}'");
    }
  }

  Ok(model)
}

fn parse_categories(s: &str) -> Result<usize, Report> {
  if s.is_empty() {
    return Ok(DEFAULT_CATEGORIES);
  }
  let categories: usize = s
    .parse()
    .wrap_err_with(|| format!("Invalid number of rate categories: '{s}'"))?;
  if categories == 0 {
    return make_error!("Number of rate categories must be positive");
  }
  Ok(categories)
}

fn parse_braced_f64(s: &str) -> Result<f64, Report> {
  let inner = s
    .strip_prefix('{')
    .and_then(|s| s.strip_suffix('}'))
    .ok_or_else(|| eyre::eyre!("Expected a value in curly braces, but found: '{s}'"))?;
  let value: f64 = inner
    .trim()
    .parse()
    .wrap_err_with(|| format!("Invalid number: '{inner}'"))?;
  if !(value >= 0.0) {
    return make_error!("Expected a non-negative value, but found {value}");
  }
  Ok(value)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::model::RateHeterogeneity;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  fn parses_gtr_with_gamma_and_ml_freqs() -> Result<(), Report> {
    let model = parse_model("GTR+G4+FO")?;
    assert_eq!(model.subst_model, SubstModel::Gtr);
    assert_eq!(model.freq_mode, FreqMode::MaxLikelihood);
    assert_eq!(
      model.rate_het,
      RateHeterogeneity::Gamma {
        alpha: 1.0,
        categories: 4
      }
    );
    Ok(())
  }

  #[rstest]
  #[case("JC", "JC")]
  #[case("hky+i+g", "HKY+I+G4")]
  #[case("GTR+R3+FE", "GTR+FE+R3")]
  #[case("BIN+ASC_LEWIS", "BIN+ASC_LEWIS")]
  #[case("JC+ASC_FELS{100}", "JC+ASC_FELS{100}")]
  fn round_trips_through_display(#[case] input: &str, #[case] expected: &str) -> Result<(), Report> {
    assert_eq!(parse_model(input)?.to_string(), expected);
    Ok(())
  }

  #[rstest]
  #[case("WAG")]
  #[case("GTR+X")]
  #[case("GTR+G0")]
  #[case("JC+ASC_FELS")]
  fn rejects_invalid(#[case] input: &str) {
    assert!(parse_model(input).is_err());
  }
}
