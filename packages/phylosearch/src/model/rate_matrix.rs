#![allow(non_snake_case)]

use crate::make_error;
use eyre::Report;
use ndarray::prelude::*;

/// Number of Taylor terms used for the exponential of the scaled-down matrix
const TAYLOR_TERMS: usize = 18;

/// Reversible instantaneous rate matrix, normalized to one expected substitution per unit of time.
#[derive(Clone, Debug)]
pub struct RateMatrix {
  pub Q: Array2<f64>,
  pub pi: Array1<f64>,
}

impl RateMatrix {
  /// Builds the rate matrix from the upper-triangle exchangeabilities (row-major) and the equilibrium frequencies
  pub fn new(subst_rates: &[f64], freqs: &[f64]) -> Result<Self, Report> {
    let n = freqs.len();
    if n < 2 {
      return make_error!("Rate matrix requires at least 2 states, but found {n}");
    }
    if subst_rates.len() != n * (n - 1) / 2 {
      return make_error!(
        "Expected {} substitution rates for {n} states, but found {}",
        n * (n - 1) / 2,
        subst_rates.len()
      );
    }
    if let Some(bad) = freqs.iter().find(|&&f| !(f > 0.0) || !f.is_finite()) {
      return make_error!("Equilibrium frequencies must be positive, but found {bad}");
    }
    if let Some(bad) = subst_rates.iter().find(|&&r| !(r > 0.0) || !r.is_finite()) {
      return make_error!("Substitution rates must be positive, but found {bad}");
    }

    let pi = {
      let pi = Array1::from(freqs.to_vec());
      let pi_sum = pi.sum();
      pi / pi_sum
    };

    let mut W = Array2::<f64>::zeros((n, n));
    let mut k = 0;
    for i in 0..n {
      for j in (i + 1)..n {
        W[[i, j]] = subst_rates[k];
        W[[j, i]] = subst_rates[k];
        k += 1;
      }
    }

    let mut Q = &W * &pi.view().insert_axis(Axis(0));
    let row_sums = Q.sum_axis(Axis(1));
    Q.diag_mut().assign(&-&row_sums);

    let average_rate = pi.dot(&row_sums);
    Q /= average_rate;

    Ok(Self { Q, pi })
  }

  #[inline]
  pub fn num_states(&self) -> usize {
    self.pi.len()
  }

  /// Transition probabilities `P(t) = exp(Qt)`, computed by scaling and squaring with a Taylor kernel
  pub fn transition_matrix(&self, t: f64) -> Array2<f64> {
    let n = self.num_states();
    let Qt = &self.Q * t;

    let norm = Qt.iter().fold(0.0_f64, |acc, x| acc.max(x.abs())) * n as f64;
    let squarings = if norm > 0.5 {
      (norm / 0.5).log2().ceil() as i32
    } else {
      0
    };
    let A = Qt / 2.0_f64.powi(squarings);

    let mut P = Array2::<f64>::eye(n);
    let mut term = Array2::<f64>::eye(n);
    for k in 1..=TAYLOR_TERMS {
      term = term.dot(&A) / k as f64;
      P += &term;
    }

    for _ in 0..squarings {
      P = P.dot(&P);
    }

    P.mapv_inplace(|p| p.max(0.0));
    P
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;
  use rstest::rstest;

  #[rstest]
  fn jc_transition_matrix_matches_closed_form() -> Result<(), Report> {
    let m = RateMatrix::new(&[1.0; 6], &[0.25; 4])?;
    for t in [0.0, 1e-6, 0.1, 1.0, 10.0] {
      let P = m.transition_matrix(t);
      let same = 0.25 + 0.75 * (-4.0 * t / 3.0).exp();
      let diff = 0.25 - 0.25 * (-4.0 * t / 3.0).exp();
      for i in 0..4 {
        for j in 0..4 {
          let expected = if i == j { same } else { diff };
          assert_ulps_eq!(P[[i, j]], expected, epsilon = 1e-12);
        }
      }
    }
    Ok(())
  }

  #[rstest]
  fn rows_sum_to_one_and_stationary() -> Result<(), Report> {
    let pi = [0.1, 0.2, 0.3, 0.4];
    let m = RateMatrix::new(&[1.0, 2.0, 0.5, 0.7, 3.0, 1.0], &pi)?;

    let mean_rate: f64 = (0..4).map(|i| -m.Q[[i, i]] * pi[i]).sum();
    assert_ulps_eq!(mean_rate, 1.0, epsilon = 1e-12);

    let P = m.transition_matrix(0.7);
    for i in 0..4 {
      assert_ulps_eq!(P.row(i).sum(), 1.0, epsilon = 1e-12);
    }
    let stationary = m.pi.dot(&P);
    for j in 0..4 {
      assert_ulps_eq!(stationary[j], pi[j], epsilon = 1e-12);
    }
    Ok(())
  }

  #[rstest]
  fn rejects_zero_frequency() {
    assert!(RateMatrix::new(&[1.0; 6], &[0.5, 0.5, 0.0, 0.0]).is_err());
  }
}
