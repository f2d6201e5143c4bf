use crate::make_error;
use eyre::Report;
use statrs::function::gamma::gamma_lr;

/// Quantile of the gamma distribution with shape `alpha` and rate `alpha` (mean 1), found by bisection
fn gamma_quantile(alpha: f64, p: f64) -> f64 {
  let cdf = |x: f64| gamma_lr(alpha, alpha * x);
  let mut low = 0.0;
  let mut high = 1.0;
  while cdf(high) < p && high < 1e12 {
    high *= 2.0;
  }
  for _ in 0..200 {
    let mid = 0.5 * (low + high);
    if cdf(mid) >= p {
      high = mid;
    } else {
      low = mid;
    }
    if high - low <= f64::EPSILON * high {
      break;
    }
  }
  0.5 * (low + high)
}

/// Category rates of the discretized gamma distribution with shape `alpha` and mean 1.
///
/// Categories have equal probability; each rate is the mean of its category (Yang 1994).
pub fn discrete_gamma_rates(alpha: f64, categories: usize) -> Result<Vec<f64>, Report> {
  if categories == 0 {
    return make_error!("Number of gamma rate categories must be positive");
  }
  if categories == 1 {
    return Ok(vec![1.0]);
  }
  if !(alpha > 0.0) || !alpha.is_finite() {
    return make_error!("Gamma shape parameter must be positive, but found {alpha}");
  }

  let k = categories as f64;

  // Incomplete gamma integral at the category boundaries, with the rate scaled by alpha
  let upper_integral = |i: usize| -> f64 {
    if i == categories {
      1.0
    } else {
      let boundary = gamma_quantile(alpha, i as f64 / k);
      gamma_lr(alpha + 1.0, boundary * alpha)
    }
  };

  let mut rates = Vec::with_capacity(categories);
  let mut prev = 0.0;
  for i in 1..=categories {
    let curr = upper_integral(i);
    rates.push((curr - prev) * k);
    prev = curr;
  }

  let mean = rates.iter().sum::<f64>() / k;
  if !(mean > 0.0) || !mean.is_finite() {
    return make_error!("Unable to discretize gamma distribution with alpha={alpha}");
  }
  Ok(rates.into_iter().map(|r| r / mean).collect())
}

/// Rescales free rates so that their weighted mean is 1 and weights so that they sum to 1
pub fn normalize_free_rates(rates: &mut [f64], weights: &mut [f64]) {
  let weight_sum: f64 = weights.iter().sum();
  weights.iter_mut().for_each(|w| *w /= weight_sum);
  let mean: f64 = rates.iter().zip(weights.iter()).map(|(r, w)| r * w).sum();
  rates.iter_mut().for_each(|r| *r /= mean);
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_abs_diff_eq;
  use rstest::rstest;

  #[rstest]
  fn gamma_rates_alpha_half_four_categories() -> Result<(), Report> {
    // Reference values from Yang (1994), mean category rates
    let rates = discrete_gamma_rates(0.5, 4)?;
    let expected = [0.0334, 0.2519, 0.8203, 2.8944];
    for (actual, expected) in rates.iter().zip(expected) {
      assert_abs_diff_eq!(*actual, expected, epsilon = 1e-3);
    }
    Ok(())
  }

  #[rstest]
  #[case(0.02)]
  #[case(1.0)]
  #[case(100.0)]
  fn gamma_rates_have_unit_mean(#[case] alpha: f64) -> Result<(), Report> {
    let rates = discrete_gamma_rates(alpha, 4)?;
    assert_abs_diff_eq!(rates.iter().sum::<f64>() / 4.0, 1.0, epsilon = 1e-10);
    assert!(rates.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
  }

  #[rstest]
  fn normalizes_free_rates() {
    let mut rates = vec![1.0, 3.0];
    let mut weights = vec![1.0, 1.0];
    normalize_free_rates(&mut rates, &mut weights);
    assert_abs_diff_eq!(weights[0], 0.5);
    assert_abs_diff_eq!(rates[0] * weights[0] + rates[1] * weights[1], 1.0, epsilon = 1e-12);
  }
}
