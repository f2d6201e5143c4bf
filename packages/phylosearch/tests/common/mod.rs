#![allow(dead_code)]

use eyre::{eyre, Report};
use itertools::Itertools;
use parking_lot::Mutex;
use phylosearch::alignment::msa::PartitionedMsa;
use phylosearch::alignment::state::StateSet;
use phylosearch::checkpoint::SearchStep;
use phylosearch::engine::{Command, SearchOptions};
use phylosearch::io::fasta::read_many_fasta_str;
use phylosearch::kernel::pruning::PruningKernel;
use phylosearch::kernel::{ClvOp, ClvRef, KernelPartition, LikelihoodKernel, PartitionSetup};
use phylosearch::model::model::Model;
use phylosearch::optimizer::observer::{PhaseEvent, SearchObserver, TreeKind};
use phylosearch::utils::random::get_random_number_generator;
use rand::Rng;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const NUCLEOTIDES: [char; 4] = ['A', 'C', 'G', 'T'];

/// Parent of every node of a rooted 8-taxon tree. Nodes 7..15 are the tips.
const PARENTS: [Option<usize>; 15] = [
  None,
  Some(0),
  Some(0),
  Some(1),
  Some(1),
  Some(2),
  Some(2),
  Some(3),
  Some(3),
  Some(4),
  Some(4),
  Some(5),
  Some(5),
  Some(6),
  Some(6),
];

const FIRST_TIP: usize = 7;

/// FASTA alignment of 8 taxa evolved along a fixed tree, each branch changing a site with probability `p_change`
pub fn simulated_fasta(num_sites: usize, p_change: f64, seed: u64) -> String {
  let mut rng = get_random_number_generator(Some(seed));
  let mut columns = vec![];
  for _ in 0..num_sites {
    let mut states = vec![0_usize; PARENTS.len()];
    for (node, parent) in PARENTS.iter().enumerate() {
      states[node] = match parent {
        None => rng.gen_range(0..4),
        Some(parent) => {
          let state = states[*parent];
          if rng.gen_bool(p_change) {
            (state + rng.gen_range(1..4)) % 4
          } else {
            state
          }
        }
      };
    }
    columns.push(states[FIRST_TIP..].to_vec());
  }

  (0..PARENTS.len() - FIRST_TIP)
    .map(|tip| {
      let seq: String = columns.iter().map(|column| NUCLEOTIDES[column[tip]]).collect();
      format!(">t{}\n{seq}\n", tip + 1)
    })
    .join("")
}

pub fn simulated_msa(num_sites: usize, model: &str) -> Result<PartitionedMsa, Report> {
  let records = read_many_fasta_str(simulated_fasta(num_sites, 0.08, 42))?;
  PartitionedMsa::from_records_single(&records, model)
}

pub fn search_options(dir: &Path, command: Command, workers: usize) -> SearchOptions {
  SearchOptions {
    command,
    workers,
    num_searches: 1,
    num_bootstraps: 0,
    prefix: dir.join("test"),
    force: workers > 1,
    max_cycles: 8,
    ..SearchOptions::default()
  }
}

/// Switch shared between a test and the kernel partitions it injects failures into
#[derive(Debug, Default)]
pub struct Fault {
  armed: AtomicBool,
  /// Fail on master ranges as well, not only on ranges of the other workers
  everywhere: bool,
}

impl Fault {
  pub fn everywhere() -> Arc<Self> {
    Arc::new(Self {
      armed: AtomicBool::new(false),
      everywhere: true,
    })
  }

  pub fn non_master() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn arm(&self) {
    self.armed.store(true, Ordering::SeqCst);
  }

  pub fn is_armed(&self) -> bool {
    self.armed.load(Ordering::SeqCst)
  }

  fn check(&self, master: bool) -> Result<(), Report> {
    if self.is_armed() && (self.everywhere || !master) {
      return Err(eyre!("Injected kernel failure"));
    }
    Ok(())
  }
}

/// Pruning kernel which fails likelihood computations while its fault is armed
pub struct FaultyKernel {
  pub fault: Arc<Fault>,
}

impl LikelihoodKernel for FaultyKernel {
  fn create_partition(&self, setup: &PartitionSetup) -> Result<Box<dyn KernelPartition>, Report> {
    Ok(Box::new(FaultyPartition {
      inner: PruningKernel.create_partition(setup)?,
      fault: Arc::clone(&self.fault),
      master: setup.master,
    }))
  }
}

struct FaultyPartition {
  inner: Box<dyn KernelPartition>,
  fault: Arc<Fault>,
  master: bool,
}

impl KernelPartition for FaultyPartition {
  fn set_tip_states(&mut self, tip: usize, states: &[StateSet]) -> Result<(), Report> {
    self.inner.set_tip_states(tip, states)
  }

  fn set_pattern_weights(&mut self, weights: &[u32]) -> Result<(), Report> {
    self.inner.set_pattern_weights(weights)
  }

  fn set_model(&mut self, model: &Model) -> Result<(), Report> {
    self.inner.set_model(model)
  }

  fn update_clv(&mut self, op: &ClvOp) -> Result<(), Report> {
    self.fault.check(self.master)?;
    self.inner.update_clv(op)
  }

  fn edge_loglh(&mut self, a: ClvRef, b: ClvRef, length: f64) -> Result<f64, Report> {
    self.fault.check(self.master)?;
    self.inner.edge_loglh(a, b, length)
  }
}

/// Records every completed phase and optionally arms a fault once a given phase of the first ML tree completes
#[derive(Default)]
pub struct RecordingObserver {
  pub events: Mutex<Vec<PhaseEvent>>,
  pub trees: Mutex<Vec<(TreeKind, usize, f64)>>,
  trigger: Option<(usize, SearchStep, Arc<Fault>)>,
}

impl RecordingObserver {
  pub fn arming(cycle: usize, step: SearchStep, fault: &Arc<Fault>) -> Self {
    Self {
      trigger: Some((cycle, step, Arc::clone(fault))),
      ..Self::default()
    }
  }

  pub fn events(&self) -> Vec<PhaseEvent> {
    self.events.lock().clone()
  }
}

impl SearchObserver for RecordingObserver {
  fn phase_completed(&self, event: &PhaseEvent) {
    self.events.lock().push(*event);
    if let Some((cycle, step, fault)) = &self.trigger {
      if event.kind == TreeKind::Ml && event.tree_index == 0 && event.cycle == *cycle && event.step == *step {
        fault.arm();
      }
    }
  }

  fn tree_completed(&self, kind: TreeKind, tree_index: usize, loglh: f64) {
    self.trees.lock().push((kind, tree_index, loglh));
  }
}
