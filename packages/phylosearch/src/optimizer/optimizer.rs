use crate::checkpoint::{CheckpointManager, SearchState, SearchStep, SprMode, SprState};
use crate::model::model::ParamFlags;
use crate::optimizer::observer::{PhaseEvent, SearchObserver, TreeKind};
use crate::treeinfo::spr::{CutoffInfo, SprRoundParams};
use crate::treeinfo::TreeInfo;
use crate::utils::float_fmt::format_loglh;
use eyre::{Report, WrapErr};
use log::{debug, info};
use smart_default::SmartDefault;

/// Model optimization thresholds of the first cycles; later cycles use the final likelihood epsilon
const MODEL_EPSILON_SCHEDULE: [f64; 3] = [10.0, 3.0, 1.0];

const RADIUS_STEP: usize = 5;
const MAX_RADIUS: usize = 22;
const AUTODETECT_KEEP_COUNT: usize = 1;
const AUTODETECT_MIN_GAIN: f64 = 0.1;
const KEEP_COUNT: usize = 20;
const MAX_MODEL_ROUNDS: usize = 16;

#[derive(Clone, Debug, SmartDefault, PartialEq)]
pub struct OptimizerOptions {
  /// Convergence threshold of the log-likelihood
  #[default = 0.1]
  pub lh_epsilon: f64,

  /// Radius of the fast SPR rounds. Zero means autodetect.
  pub spr_radius: usize,

  #[default = 1.0]
  pub spr_cutoff: f64,

  #[default = true]
  pub optimize_model: bool,

  #[default = true]
  pub optimize_brlen: bool,

  /// Upper bound on the number of optimization cycles per tree
  #[default = 64]
  pub max_cycles: usize,
}

/// Drives the optimization of one tree through its phases, checkpointing after each of them.
///
/// A cycle optimizes the model, then the branch lengths, then (when searching) performs one SPR round. All workers run
/// the optimizer in lockstep: every decision is taken on likelihoods which are identical on all of them.
pub struct Optimizer<'o> {
  options: OptimizerOptions,
  observer: Option<&'o dyn SearchObserver>,
}

impl<'o> Optimizer<'o> {
  pub fn new(options: OptimizerOptions, observer: Option<&'o dyn SearchObserver>) -> Self {
    Self { options, observer }
  }

  /// Full ML search on the tree: model, branch lengths and topology, resuming from the checkpointed phase
  pub fn optimize_topology(
    &self,
    treeinfo: &mut TreeInfo,
    cm: &CheckpointManager,
    kind: TreeKind,
    tree_index: usize,
  ) -> Result<f64, Report> {
    self
      .run(treeinfo, cm, kind, tree_index, true)
      .wrap_err_with(|| format!("When optimizing tree #{}", tree_index + 1))
  }

  /// Optimizes model and branch lengths of a fixed topology. With both disabled this is a single likelihood read.
  pub fn evaluate(&self, treeinfo: &mut TreeInfo, cm: &CheckpointManager, tree_index: usize) -> Result<f64, Report> {
    self
      .run(treeinfo, cm, TreeKind::Ml, tree_index, false)
      .wrap_err_with(|| format!("When evaluating tree #{}", tree_index + 1))
  }

  fn run(
    &self,
    treeinfo: &mut TreeInfo,
    cm: &CheckpointManager,
    kind: TreeKind,
    tree_index: usize,
    search: bool,
  ) -> Result<f64, Report> {
    let mut state = cm.search_state();
    // Nobody may publish a new state before everyone has read the checkpointed one
    treeinfo.ctx().barrier();

    let mut loglh = treeinfo.loglh(false)?;
    if state.step != SearchStep::Start || state.cycle > 0 {
      debug!("Resuming tree #{} at {:?}, cycle {}", tree_index + 1, state.step, state.cycle);
    }

    if !search && !self.options.optimize_model && !self.options.optimize_brlen && state.step != SearchStep::Done {
      self.complete(treeinfo, cm, &mut state, SearchStep::Done, loglh, kind, tree_index)?;
    }

    let lh_epsilon = self.options.lh_epsilon;
    loop {
      match state.step {
        SearchStep::Start => {
          state.cycle_start_loglh = loglh;
          loglh = self.optimize_model(treeinfo, self.model_epsilon(state.cycle))?;
          self.complete(treeinfo, cm, &mut state, SearchStep::ModelOptimized, loglh, kind, tree_index)?;
        }
        SearchStep::ModelOptimized => {
          if self.options.optimize_brlen {
            loglh = treeinfo.optimize_branch_lengths(self.model_epsilon(state.cycle), 1)?;
          }
          self.complete(treeinfo, cm, &mut state, SearchStep::BranchLengthsOptimized, loglh, kind, tree_index)?;
        }
        SearchStep::BranchLengthsOptimized if search => {
          let num_tips = treeinfo.tree().num_tips();
          let mut spr = state
            .spr
            .unwrap_or_else(|| self.initial_spr_state(num_tips, loglh));
          loglh = self.spr_step(treeinfo, &mut spr, loglh)?;
          state.spr = Some(spr);
          self.complete(treeinfo, cm, &mut state, SearchStep::TopologySearching, loglh, kind, tree_index)?;
        }
        SearchStep::BranchLengthsOptimized => {
          let converged = state.cycle >= MODEL_EPSILON_SCHEDULE.len() && loglh - state.cycle_start_loglh < lh_epsilon;
          if converged || state.cycle + 1 >= self.options.max_cycles {
            self.complete(treeinfo, cm, &mut state, SearchStep::Done, loglh, kind, tree_index)?;
          } else {
            state.cycle += 1;
            state.step = SearchStep::Start;
          }
        }
        SearchStep::TopologySearching => {
          let finished = state.spr.map_or(true, |spr| spr.mode == SprMode::Finished);
          if finished || state.cycle + 1 >= self.options.max_cycles {
            loglh = self.optimize_model(treeinfo, lh_epsilon)?;
            if self.options.optimize_brlen {
              loglh = treeinfo.optimize_branch_lengths(lh_epsilon, 1)?;
            }
            self.complete(treeinfo, cm, &mut state, SearchStep::Done, loglh, kind, tree_index)?;
          } else {
            state.cycle += 1;
            state.step = SearchStep::Start;
          }
        }
        SearchStep::Done => return Ok(loglh),
      }
    }
  }

  /// Repeats model optimization rounds until a round gains less than `epsilon`
  fn optimize_model(&self, treeinfo: &mut TreeInfo, epsilon: f64) -> Result<f64, Report> {
    let mut loglh = treeinfo.loglh(true)?;
    if !self.options.optimize_model {
      return Ok(loglh);
    }
    for _ in 0..MAX_MODEL_ROUNDS {
      let before = loglh;
      loglh = treeinfo.optimize_parameters(ParamFlags::all(), self.options.optimize_brlen, epsilon)?;
      if loglh - before <= epsilon {
        break;
      }
    }
    Ok(loglh)
  }

  fn model_epsilon(&self, cycle: usize) -> f64 {
    MODEL_EPSILON_SCHEDULE
      .get(cycle)
      .copied()
      .unwrap_or(self.options.lh_epsilon)
      .max(self.options.lh_epsilon)
  }

  fn initial_spr_state(&self, num_tips: usize, loglh: f64) -> SprState {
    let radius = if self.options.spr_radius > 0 {
      self.options.spr_radius
    } else {
      RADIUS_STEP
    };
    let mode = if self.options.spr_radius == 0 && radius_limit(num_tips) > 1 {
      SprMode::Autodetect
    } else {
      SprMode::Fast
    };
    SprState {
      mode,
      radius_min: 1,
      radius_max: radius,
      fast_radius: radius,
      cutoff: CutoffInfo::new(loglh),
    }
  }

  /// One SPR round followed by branch length optimization, then advances the radius schedule
  fn spr_step(&self, treeinfo: &mut TreeInfo, spr: &mut SprState, loglh: f64) -> Result<f64, Report> {
    let lh_epsilon = self.options.lh_epsilon;
    let limit = radius_limit(treeinfo.tree().num_tips());
    let autodetect = spr.mode == SprMode::Autodetect;
    let params = SprRoundParams {
      radius_min: spr.radius_min,
      radius_max: spr.radius_max,
      keep_count: if autodetect { AUTODETECT_KEEP_COUNT } else { KEEP_COUNT },
      thorough: spr.mode == SprMode::Thorough,
      subtree_cutoff: if autodetect { 0.0 } else { self.options.spr_cutoff },
      lh_epsilon,
    };

    let before = loglh;
    let mut loglh = treeinfo.spr_round(&params, &mut spr.cutoff)?;
    if self.options.optimize_brlen {
      loglh = treeinfo.optimize_branch_lengths(lh_epsilon, 1)?;
    }
    let gain = loglh - before;

    match spr.mode {
      SprMode::Autodetect => {
        if gain > AUTODETECT_MIN_GAIN {
          spr.fast_radius = spr.radius_max;
          spr.radius_min += RADIUS_STEP;
          spr.radius_max += RADIUS_STEP;
        }
        if gain <= AUTODETECT_MIN_GAIN || spr.radius_min >= limit {
          spr.mode = SprMode::Fast;
          spr.radius_min = 1;
          spr.radius_max = spr.fast_radius;
          spr.cutoff = CutoffInfo::new(loglh);
          debug!("SPR radius for fast rounds: {}", spr.fast_radius);
        }
      }
      SprMode::Fast => {
        if gain <= lh_epsilon {
          spr.mode = SprMode::Thorough;
          spr.radius_min = 1;
          spr.radius_max = RADIUS_STEP;
        }
      }
      SprMode::Thorough => {
        if gain > lh_epsilon {
          spr.radius_min = 1;
          spr.radius_max = RADIUS_STEP;
        } else {
          spr.radius_min = spr.radius_max + 1;
          spr.radius_max += RADIUS_STEP;
          if spr.radius_min >= limit {
            spr.mode = SprMode::Finished;
          }
        }
      }
      SprMode::Finished => {}
    }

    Ok(loglh)
  }

  /// Records a completed phase in the checkpoint, then reports it
  #[allow(clippy::too_many_arguments)]
  fn complete(
    &self,
    treeinfo: &TreeInfo,
    cm: &CheckpointManager,
    state: &mut SearchState,
    step: SearchStep,
    loglh: f64,
    kind: TreeKind,
    tree_index: usize,
  ) -> Result<(), Report> {
    state.step = step;
    state.loglh = loglh;
    cm.update_and_write(treeinfo.ctx(), treeinfo, state)?;

    if treeinfo.ctx().is_coordinator() {
      let what = match kind {
        TreeKind::Ml => "Tree",
        TreeKind::Bootstrap => "Bootstrap tree",
      };
      let radius = state
        .spr
        .filter(|_| step == SearchStep::TopologySearching)
        .map(|spr| format!(" ({:?} SPR, next radius {}..{})", spr.mode, spr.radius_min, spr.radius_max))
        .unwrap_or_default();
      info!(
        "{what} #{}, cycle {}: {step:?}{radius}, logLH = {}",
        tree_index + 1,
        state.cycle,
        format_loglh(loglh)
      );

      if let Some(observer) = self.observer {
        observer.phase_completed(&PhaseEvent {
          kind,
          tree_index,
          cycle: state.cycle,
          step,
          loglh,
        });
      }
    }
    Ok(())
  }
}

/// Largest useful SPR radius for a tree with this many tips
pub fn radius_limit(num_tips: usize) -> usize {
  MAX_RADIUS.min(num_tips.saturating_sub(3)).max(1)
}
