use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct BarrierState {
  arrived: usize,
  generation: u64,
}

/// Reusable barrier for a fixed number of participants
#[derive(Debug)]
pub struct Barrier {
  num_participants: usize,
  state: Mutex<BarrierState>,
  cvar: Condvar,
}

impl Barrier {
  pub fn new(num_participants: usize) -> Self {
    Self {
      num_participants,
      state: Mutex::new(BarrierState::default()),
      cvar: Condvar::new(),
    }
  }

  /// Blocks until all participants have called `wait` for the current generation
  pub fn wait(&self) {
    let mut state = self.state.lock();
    let generation = state.generation;
    state.arrived += 1;
    if state.arrived == self.num_participants {
      state.arrived = 0;
      state.generation = state.generation.wrapping_add(1);
      self.cvar.notify_all();
    } else {
      while state.generation == generation {
        self.cvar.wait(&mut state);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;

  #[test]
  fn nobody_passes_before_everyone_arrives() {
    let n = 4;
    let barrier = Arc::new(Barrier::new(n));
    let counter = Arc::new(AtomicUsize::new(0));

    let handles = (0..n)
      .map(|_| {
        let barrier = Arc::clone(&barrier);
        let counter = Arc::clone(&counter);
        std::thread::spawn(move || {
          for round in 0..10 {
            counter.fetch_add(1, Ordering::SeqCst);
            barrier.wait();
            assert!(counter.load(Ordering::SeqCst) >= (round + 1) * n);
            barrier.wait();
          }
        })
      })
      .collect::<Vec<_>>();

    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(counter.load(Ordering::SeqCst), 10 * n);
  }
}
