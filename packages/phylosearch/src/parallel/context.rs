use crate::parallel::barrier::Barrier;
use crate::utils::error::report_to_string;
use crate::{make_error, make_internal_error};
use eyre::{Report, WrapErr};
use log::debug;
use parking_lot::{Mutex, RwLock};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Minimum number of reduction slots per execution unit
const MIN_SLOTS_PER_WORKER: usize = 128;

/// Fixed pool of cooperating execution units.
///
/// The pool is created once and every call to `run` executes one closure per unit, all of them concurrently. Units
/// synchronize only through the collective operations of their `WorkerContext`.
pub struct ParallelContext {
  num_workers: usize,
  pool: ThreadPool,
  group: Arc<WorkerGroup>,
  /// Held for the duration of `run`, as all runs share the same group state
  running: Mutex<()>,
}

impl ParallelContext {
  /// The reduction scratch buffer holds at least two values per partition for every unit
  pub fn new(num_workers: usize, num_partitions: usize) -> Result<Self, Report> {
    if num_workers == 0 {
      return make_error!("Number of workers must be positive");
    }

    let pool = ThreadPoolBuilder::new()
      .num_threads(num_workers)
      .thread_name(|i| format!("worker-{i}"))
      .build()
      .wrap_err_with(|| format!("When creating a pool of {num_workers} worker thread(s)"))?;

    let slots_per_worker = MIN_SLOTS_PER_WORKER.max(2 * num_partitions);
    debug!(
      "Parallel reduction buffer: {num_workers} x {slots_per_worker} values ({} KB)",
      num_workers * slots_per_worker * 8 / 1024
    );

    Ok(Self {
      num_workers,
      pool,
      group: Arc::new(WorkerGroup::new(num_workers, slots_per_worker)),
      running: Mutex::new(()),
    })
  }

  #[inline]
  pub const fn num_workers(&self) -> usize {
    self.num_workers
  }

  /// Runs `f` on every execution unit and returns the results in rank order.
  ///
  /// If any unit fails, the error of the lowest rank which failed on its own is returned, in preference to the
  /// errors of units which only observed that failure. Units must fail collectively (see
  /// `WorkerContext::agree`): a unit which returns early while others wait in a collective operation deadlocks the run.
  pub fn run<R, F>(&self, f: F) -> Result<Vec<R>, Report>
  where
    R: Send,
    F: Fn(&WorkerContext) -> Result<R, Report> + Sync,
  {
    let _running = self.running.lock();
    let results = self.pool.broadcast(|broadcast_ctx| {
      let ctx = WorkerContext {
        rank: broadcast_ctx.index(),
        group: Arc::clone(&self.group),
      };
      f(&ctx)
    });

    let mut values = Vec::with_capacity(results.len());
    let mut error: Option<Report> = None;
    for result in results {
      match result {
        Ok(value) => values.push(value),
        Err(report) => match &error {
          Some(first) if !is_remote_failure(first) || is_remote_failure(&report) => {}
          _ => error = Some(report),
        },
      }
    }

    match error {
      Some(report) => Err(report),
      None => Ok(values),
    }
  }
}

/// Failure of a unit which only learned, through a collective operation, that another unit failed
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFailure {
  pub message: String,
}

impl Display for RemoteFailure {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.message)
  }
}

impl std::error::Error for RemoteFailure {}

pub fn remote_failure(message: impl Into<String>) -> Report {
  Report::new(RemoteFailure {
    message: message.into(),
  })
}

pub fn is_remote_failure(report: &Report) -> bool {
  report.chain().any(|cause| cause.downcast_ref::<RemoteFailure>().is_some())
}

/// State shared by the units of a context, reused by every `run`
struct WorkerGroup {
  num_workers: usize,
  slots_per_worker: usize,
  barrier: Barrier,
  scratch: RwLock<Vec<f64>>,
  broadcast_slot: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

impl WorkerGroup {
  fn new(num_workers: usize, slots_per_worker: usize) -> Self {
    Self {
      num_workers,
      slots_per_worker,
      barrier: Barrier::new(num_workers),
      scratch: RwLock::new(vec![0.0; num_workers * slots_per_worker]),
      broadcast_slot: Mutex::new(None),
    }
  }
}

/// Capability to perform durable writes (checkpoint and result files). Only the coordinating unit can obtain it.
#[derive(Debug)]
pub struct Coordinator {
  _private: (),
}

/// Handle of one execution unit, passed explicitly to everything that takes part in collective operations
#[derive(Clone)]
pub struct WorkerContext {
  rank: usize,
  group: Arc<WorkerGroup>,
}

impl WorkerContext {
  #[inline]
  pub const fn rank(&self) -> usize {
    self.rank
  }

  #[inline]
  pub fn num_workers(&self) -> usize {
    self.group.num_workers
  }

  #[inline]
  pub const fn is_coordinator(&self) -> bool {
    self.rank == 0
  }

  pub fn coordinator(&self) -> Option<Coordinator> {
    self.is_coordinator().then_some(Coordinator { _private: () })
  }

  /// Blocks until every unit reaches this barrier
  pub fn barrier(&self) {
    self.group.barrier.wait();
  }

  /// Element-wise sum over all units, in place.
  ///
  /// Every unit writes its own slot of the scratch buffer, then all units add up the slots in rank order, so the
  /// result is bitwise identical everywhere.
  pub fn reduce_sum(&self, values: &mut [f64]) {
    let n = self.group.num_workers;
    if n == 1 {
      return;
    }

    let slots = self.group.slots_per_worker;
    let own = self.rank * slots;
    for chunk in values.chunks_mut(slots) {
      {
        let mut scratch = self.group.scratch.write();
        scratch[own..own + chunk.len()].copy_from_slice(chunk);
      }
      self.barrier();
      {
        let scratch = self.group.scratch.read();
        for (i, value) in chunk.iter_mut().enumerate() {
          *value = (0..n).fold(0.0, |acc, rank| acc + scratch[rank * slots + i]);
        }
      }
      self.barrier();
    }
  }

  pub fn reduce_sum_scalar(&self, value: f64) -> f64 {
    let mut values = [value];
    self.reduce_sum(&mut values);
    values[0]
  }

  /// Value produced by the coordinator, delivered to every unit. An error of the producer is delivered as well.
  pub fn broadcast<T, F>(&self, produce: F) -> Result<T, Report>
  where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Result<T, Report>,
  {
    if self.is_coordinator() {
      let value = produce();
      let shared: Result<T, String> = match &value {
        Ok(value) => Ok(value.clone()),
        Err(report) => Err(report_to_string(report)),
      };
      *self.group.broadcast_slot.lock() = Some(Box::new(shared));
      self.barrier();
      self.barrier();
      *self.group.broadcast_slot.lock() = None;
      value
    } else {
      self.barrier();
      let shared = self
        .group
        .broadcast_slot
        .lock()
        .as_ref()
        .and_then(|value| value.downcast_ref::<Result<T, String>>())
        .cloned();
      self.barrier();
      match shared {
        Some(Ok(value)) => Ok(value),
        Some(Err(message)) => Err(remote_failure(message)),
        None => make_internal_error!("Broadcast value has unexpected type"),
      }
    }
  }

  /// Collective success check: fails on every unit if it failed on any of them
  pub fn agree<T>(&self, local: Result<T, Report>) -> Result<T, Report> {
    let failed = self.reduce_sum_scalar(if local.is_err() { 1.0 } else { 0.0 });
    match local {
      Err(report) => Err(report),
      Ok(_) if failed > 0.0 => Err(remote_failure(format!("Aborted because {failed} other worker(s) failed"))),
      Ok(value) => Ok(value),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  #[case(1)]
  #[case(3)]
  #[case(8)]
  fn reduces_sum_identically_on_all_units(#[case] num_workers: usize) -> Result<(), Report> {
    let ctx = ParallelContext::new(num_workers, 1)?;
    let results = ctx.run(|worker| {
      // More values than slots to exercise chunking
      let mut values = (0..300).map(|i| (worker.rank() * 1000 + i) as f64 * 0.1).collect::<Vec<_>>();
      worker.reduce_sum(&mut values);
      Ok(values)
    })?;

    for values in &results {
      assert_eq!(values, &results[0]);
    }
    let expected = (0..num_workers).fold(0.0, |acc, r| acc + (r * 1000 + 7) as f64 * 0.1);
    approx::assert_relative_eq!(results[0][7], expected, max_relative = 1e-12);
    Ok(())
  }

  #[rstest]
  fn broadcasts_from_coordinator() -> Result<(), Report> {
    let ctx = ParallelContext::new(4, 1)?;
    let results = ctx.run(|worker| worker.broadcast(|| Ok(vec![worker.rank(), 42])))?;
    assert!(results.iter().all(|r| r == &vec![0, 42]));
    Ok(())
  }

  #[rstest]
  fn broadcast_delivers_errors() -> Result<(), Report> {
    let ctx = ParallelContext::new(3, 1)?;
    let result = ctx.run(|worker| worker.broadcast::<usize, _>(|| make_error!("bad input")));
    assert!(result.is_err());
    Ok(())
  }

  #[rstest]
  fn agree_fails_everywhere() -> Result<(), Report> {
    let ctx = ParallelContext::new(3, 1)?;
    let outcomes = ctx.run(|worker| {
      let local = if worker.rank() == 2 { make_error!("kernel failure") } else { Ok(()) };
      Ok(worker.agree(local).is_err())
    })?;
    assert_eq!(outcomes, vec![true, true, true]);
    Ok(())
  }

  #[rstest]
  fn run_reports_error_of_failing_unit() -> Result<(), Report> {
    let ctx = ParallelContext::new(3, 1)?;
    let result = ctx.run(|worker| {
      let local = if worker.rank() == 2 { make_error!("kernel failure") } else { Ok(()) };
      worker.agree(local)
    });
    let report = result.unwrap_err();
    assert!(!is_remote_failure(&report));
    assert_eq!(report_to_string(&report), "kernel failure");
    Ok(())
  }

  #[rstest]
  fn reuses_scratch_buffer_across_runs() -> Result<(), Report> {
    let ctx = ParallelContext::new(2, 1)?;
    let scratch_address = |worker: &WorkerContext| worker.group.scratch.read().as_ptr() as usize;

    let first = ctx.run(|worker| {
      let sum = worker.reduce_sum_scalar(1.0);
      Ok((scratch_address(worker), sum))
    })?;
    let second = ctx.run(|worker| {
      let sum = worker.reduce_sum_scalar(2.0);
      Ok((scratch_address(worker), sum))
    })?;

    assert_eq!(first[0].0, second[0].0);
    assert_eq!(first.iter().map(|r| r.1).collect::<Vec<_>>(), vec![2.0, 2.0]);
    assert_eq!(second.iter().map(|r| r.1).collect::<Vec<_>>(), vec![4.0, 4.0]);
    Ok(())
  }

  #[rstest]
  fn only_rank_zero_is_coordinator() -> Result<(), Report> {
    let ctx = ParallelContext::new(4, 1)?;
    let flags = ctx.run(|worker| Ok(worker.coordinator().is_some()))?;
    assert_eq!(flags, vec![true, false, false, false]);
    Ok(())
  }
}
