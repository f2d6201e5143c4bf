use crate::checkpoint::SearchStep;

/// Whether a tree comes from the ML search (or evaluation) or is a bootstrap replicate
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TreeKind {
  Ml,
  Bootstrap,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PhaseEvent {
  pub kind: TreeKind,
  pub tree_index: usize,
  pub cycle: usize,
  pub step: SearchStep,
  pub loglh: f64,
}

/// Receives progress of the optimization. Purely observational: called on the coordinator only, after the phase has
/// been checkpointed.
pub trait SearchObserver: Send + Sync {
  fn phase_completed(&self, _event: &PhaseEvent) {}

  fn tree_completed(&self, _kind: TreeKind, _tree_index: usize, _loglh: f64) {}
}
