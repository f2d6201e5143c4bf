use crate::constants::{BRLEN_SMOOTHINGS, MAX_BRLEN, MIN_BRLEN, PARAM_EPSILON};
use crate::optimize::brent::minimize_scalar_brent_bounded;
use crate::tree::tree::EdgeId;
use crate::treeinfo::{check_no_decrease, BrlenLinkage, TreeInfo};
use eyre::Report;
use log::trace;

const STAGE: &str = "branch length optimization";

impl TreeInfo {
  /// Optimizes every branch length in turn, repeating the pass until it gains less than `epsilon` or the number of
  /// passes reaches `BRLEN_SMOOTHINGS * smoothing_factor`. With scaled linkage the per-partition scalers are optimized
  /// afterwards.
  pub fn optimize_branch_lengths(&mut self, epsilon: f64, smoothing_factor: usize) -> Result<f64, Report> {
    let mut loglh = self.loglh(true)?;

    let max_passes = BRLEN_SMOOTHINGS * smoothing_factor.max(1);
    for pass in 0..max_passes {
      let start = loglh;
      for edge in self.tree().traversal_branches() {
        loglh = self.optimize_branch(edge)?;
      }
      check_no_decrease(start, loglh, STAGE)?;
      trace!("Branch length pass {pass}: {loglh:.6}");
      if loglh - start < epsilon {
        break;
      }
    }

    if self.linkage() == BrlenLinkage::Scaled && self.num_partitions() > 1 {
      let before = loglh;
      loglh = self.optimize_brlen_scalers()?;
      check_no_decrease(before, loglh, "branch length scalers")?;
    }

    Ok(loglh)
  }

  /// Optimizes the length of one branch, evaluating the likelihood across that branch. Keeps the original length if no
  /// better one is found.
  pub(crate) fn optimize_branch(&mut self, edge: EdgeId) -> Result<f64, Report> {
    let saved = self.tree().branch_length(edge);
    let start = self.evaluate_at(edge, STAGE)?;

    let (best, cost) = minimize_scalar_brent_bounded(
      |log_length| {
        self.set_branch_length(edge, log_length.exp().clamp(MIN_BRLEN, MAX_BRLEN));
        Ok(-self.evaluate_at(edge, STAGE)?)
      },
      (MIN_BRLEN.ln(), MAX_BRLEN.ln()),
      PARAM_EPSILON,
    )?;

    let length = if -cost > start {
      best.exp().clamp(MIN_BRLEN, MAX_BRLEN)
    } else {
      saved
    };
    self.set_branch_length(edge, length);
    self.evaluate_at(edge, STAGE)
  }
}
