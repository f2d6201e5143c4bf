//! Subtree prune-and-regraft rounds

use crate::tree::tree::{EdgeId, NodeId};
use crate::treeinfo::TreeInfo;
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};

const STAGE: &str = "SPR round";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SprRoundParams {
  /// Regraft positions closer than this many branches to the prune position are skipped
  pub radius_min: usize,
  pub radius_max: usize,
  /// Number of best-scoring moves which are re-optimized
  pub keep_count: usize,
  /// Optimize the branches around the regraft position when scoring a move, and all branches when re-optimizing
  pub thorough: bool,
  /// Stop descending past a regraft position whose loss exceeds `subtree_cutoff` times the average loss. Zero disables.
  pub subtree_cutoff: f64,
  pub lh_epsilon: f64,
}

/// Running estimate of the likelihood loss of regraft positions, used to prune the search
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CutoffInfo {
  pub lh_dec_count: usize,
  pub lh_dec_sum: f64,
  pub lh_cutoff: f64,
}

impl CutoffInfo {
  pub fn new(loglh: f64) -> Self {
    Self {
      lh_dec_count: 0,
      lh_dec_sum: 0.0,
      lh_cutoff: loglh / -1000.0,
    }
  }

  fn record(&mut self, decrease: f64, subtree_cutoff: f64) {
    self.lh_dec_sum += decrease;
    self.lh_dec_count += 1;
    self.lh_cutoff = self.lh_dec_sum / self.lh_dec_count as f64 * subtree_cutoff;
  }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
  loglh: f64,
  prune_edge: EdgeId,
  subtree_node: NodeId,
  target: EdgeId,
}

impl TreeInfo {
  /// One round of SPR moves over every prunable subtree. The best `keep_count` moves are re-optimized, and the best of
  /// them is adopted only if it improves the likelihood. Otherwise the tree stays as it was.
  pub fn spr_round(&mut self, params: &SprRoundParams, cutoff: &mut CutoffInfo) -> Result<f64, Report> {
    self.spr_round_impl(params, cutoff).wrap_err_with(|| {
      format!(
        "When performing {} SPR round with radius {}..{}",
        if params.thorough { "a thorough" } else { "a fast" },
        params.radius_min,
        params.radius_max
      )
    })
  }

  fn spr_round_impl(&mut self, params: &SprRoundParams, cutoff: &mut CutoffInfo) -> Result<f64, Report> {
    let start_loglh = self.loglh(true)?;

    let mut candidates: Vec<Candidate> = vec![];
    for prune_edge in 0..self.tree().num_branches() {
      let branch = *self.tree().branch(prune_edge);
      for subtree_node in [branch.a, branch.b] {
        if self.tree().is_tip(self.tree().other_end(prune_edge, subtree_node)) {
          continue;
        }
        self.score_regrafts(prune_edge, subtree_node, params, cutoff, start_loglh, &mut candidates)?;
      }
    }

    let original = self.tree().topology();
    let mut best: Option<(f64, _)> = None;
    for candidate in &candidates {
      let spr = self.apply_spr(candidate.prune_edge, candidate.subtree_node, candidate.target)?;
      let loglh = if params.thorough {
        self.optimize_branch_lengths(params.lh_epsilon, 1)?
      } else {
        let mut loglh = candidate.loglh;
        for edge in self.tree().spr_branches(&spr) {
          loglh = self.optimize_branch(edge)?;
        }
        loglh
      };

      if loglh > best.as_ref().map_or(start_loglh, |(best_loglh, _)| *best_loglh) {
        best = Some((loglh, self.tree().topology()));
      }
      self.set_topology(&original)?;
    }

    let loglh = match best {
      Some((improved, topology)) => {
        debug!(
          "SPR round: {} candidate(s), improved {start_loglh:.6} -> {improved:.6}",
          candidates.len()
        );
        self.set_topology(&topology)?;
        self.loglh(true)?
      }
      None => {
        debug!("SPR round: {} candidate(s), no improvement", candidates.len());
        self.loglh(true)?
      }
    };
    Ok(loglh)
  }

  /// Scores regrafting the subtree at `subtree_node` onto the branches within the radius band, walking outwards from
  /// the prune position on both sides
  fn score_regrafts(
    &mut self,
    prune_edge: EdgeId,
    subtree_node: NodeId,
    params: &SprRoundParams,
    cutoff: &mut CutoffInfo,
    base_loglh: f64,
    candidates: &mut Vec<Candidate>,
  ) -> Result<(), Report> {
    let attachment = self.tree().other_end(prune_edge, subtree_node);
    let mut stack = self
      .tree()
      .children(attachment, prune_edge)
      .map(|(edge, node)| (node, edge, 0_usize))
      .collect_vec();

    while let Some((node, from, depth)) = stack.pop() {
      let depth = depth + 1;
      for (target, child) in self.tree().children(node, from).collect_vec() {
        let mut descend = depth < params.radius_max;

        if depth >= params.radius_min {
          let loglh = self.score_regraft(prune_edge, subtree_node, target, params.thorough)?;
          keep_best(
            candidates,
            Candidate {
              loglh,
              prune_edge,
              subtree_node,
              target,
            },
            params.keep_count,
          );

          if loglh < base_loglh {
            let decrease = base_loglh - loglh;
            cutoff.record(decrease, params.subtree_cutoff);
            if params.subtree_cutoff > 0.0 && decrease > cutoff.lh_cutoff {
              descend = false;
            }
          }
        }

        if descend && !self.tree().is_tip(child) {
          stack.push((child, target, depth));
        }
      }
    }
    Ok(())
  }

  /// Log-likelihood of the tree with one SPR move applied. The move is reverted before returning.
  fn score_regraft(
    &mut self,
    prune_edge: EdgeId,
    subtree_node: NodeId,
    target: EdgeId,
    thorough: bool,
  ) -> Result<f64, Report> {
    let prune_length = self.tree().branch_length(prune_edge);
    let spr = self.apply_spr(prune_edge, subtree_node, target)?;

    let loglh = if thorough {
      let mut loglh = f64::NEG_INFINITY;
      for edge in self.tree().spr_branches(&spr) {
        loglh = self.optimize_branch(edge)?;
      }
      loglh
    } else {
      self.evaluate_at(prune_edge, STAGE)?
    };

    self.revert_spr(&spr);
    self.set_branch_length(prune_edge, prune_length);
    Ok(loglh)
  }
}

/// Inserts the candidate into the list sorted by decreasing likelihood, keeping at most `keep_count`
fn keep_best(candidates: &mut Vec<Candidate>, candidate: Candidate, keep_count: usize) {
  if keep_count == 0 {
    return;
  }
  let position = candidates.partition_point(|c| c.loglh >= candidate.loglh);
  if position >= keep_count {
    return;
  }
  candidates.insert(position, candidate);
  candidates.truncate(keep_count);
}
