//! Distribution of alignment sites over execution units.
//!
//! Sites of all partitions are laid out in partition order and cut into contiguous chunks of (nearly) equal total
//! cost. A chunk may span several partitions and a partition may be spread over several consecutive workers.

use crate::make_error;
use eyre::Report;
use itertools::Itertools;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Number of sites of one partition and the computational cost of each of them
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PartitionSiteCost {
  pub partition: usize,
  pub sites: usize,
  pub site_cost: f64,
}

/// Contiguous slice `[start, start + length)` of one partition's sites owned by one worker.
///
/// Exactly one range per partition is the master, which applies the partition-wide one-time terms of the likelihood.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionRange {
  pub partition: usize,
  pub start: usize,
  pub length: usize,
  pub master: bool,
}

impl PartitionRange {
  #[inline]
  pub const fn end(&self) -> usize {
    self.start + self.length
  }
}

/// Ranges owned by each worker, indexed by worker rank
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
  workers: Vec<Vec<PartitionRange>>,
}

impl Assignment {
  #[inline]
  pub fn num_workers(&self) -> usize {
    self.workers.len()
  }

  #[inline]
  pub fn worker(&self, rank: usize) -> &[PartitionRange] {
    &self.workers[rank]
  }

  pub fn worker_sites(&self, rank: usize) -> usize {
    self.workers[rank].iter().map(|r| r.length).sum()
  }

  pub fn worker_cost(&self, rank: usize, costs: &[PartitionSiteCost]) -> f64 {
    self.workers[rank]
      .iter()
      .map(|r| {
        let site_cost = costs.iter().find(|c| c.partition == r.partition).map_or(0.0, |c| c.site_cost);
        r.length as f64 * site_cost
      })
      .sum()
  }

  pub fn stats(&self) -> AssignmentStats {
    let sites = (0..self.num_workers()).map(|w| self.worker_sites(w)).collect_vec();
    AssignmentStats {
      num_workers: self.num_workers(),
      total_sites: sites.iter().sum(),
      min_worker_sites: sites.iter().copied().min().unwrap_or_default(),
      max_worker_sites: sites.iter().copied().max().unwrap_or_default(),
      max_worker_partitions: self.workers.iter().map(Vec::len).max().unwrap_or_default(),
    }
  }

  /// Verifies that the ranges of every partition cover `[0, size)` exactly once and that each partition has exactly
  /// one master range
  pub fn check_coverage(&self, partition_sizes: &[usize]) -> Result<(), Report> {
    for (partition, &size) in partition_sizes.iter().enumerate() {
      let ranges = self
        .workers
        .iter()
        .flatten()
        .filter(|r| r.partition == partition)
        .sorted_by_key(|r| (r.start, r.length))
        .collect_vec();

      let masters = ranges.iter().filter(|r| r.master).count();
      if masters != 1 {
        return make_error!("Partition #{partition} has {masters} master ranges, expected exactly 1");
      }

      let mut pos = 0;
      for r in ranges.iter().filter(|r| r.length > 0) {
        if r.start != pos {
          return make_error!("Partition #{partition}: range starting at {} leaves a gap or overlap at {pos}", r.start);
        }
        pos = r.end();
      }
      if pos != size {
        return make_error!("Partition #{partition}: ranges cover [0, {pos}), but partition has {size} sites");
      }
    }
    Ok(())
  }
}

impl Display for Assignment {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    for (rank, ranges) in self.workers.iter().enumerate() {
      let ranges = ranges
        .iter()
        .map(|r| {
          let master = if r.master { "*" } else { "" };
          format!("{}{master}[{}..{})", r.partition, r.start, r.end())
        })
        .join(" ");
      writeln!(f, "worker {rank}: {ranges}")?;
    }
    Ok(())
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AssignmentStats {
  pub num_workers: usize,
  pub total_sites: usize,
  pub min_worker_sites: usize,
  pub max_worker_sites: usize,
  pub max_worker_partitions: usize,
}

impl Display for AssignmentStats {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "{} worker(s), sites per worker: {}..{}, max. partitions per worker: {}",
      self.num_workers, self.min_worker_sites, self.max_worker_sites, self.max_worker_partitions
    )
  }
}

/// Splits the sites of all partitions into `num_workers` contiguous chunks of balanced cost.
///
/// Chunk boundaries are placed at the site where the cumulative cost is nearest to `w * total / num_workers`, so the
/// cost of every worker differs from the average by at most the cost of one site.
pub fn balance(costs: &[PartitionSiteCost], num_workers: usize) -> Result<Assignment, Report> {
  if num_workers == 0 {
    return make_error!("Number of workers must be positive");
  }
  if let Some(c) = costs.iter().find(|c| !(c.site_cost >= 0.0) || !c.site_cost.is_finite()) {
    return make_error!("Partition #{}: invalid site cost {}", c.partition, c.site_cost);
  }

  let total_sites: usize = costs.iter().map(|c| c.sites).sum();
  let total_cost: f64 = costs.iter().map(|c| c.sites as f64 * c.site_cost).sum();

  // Global offset of the first site of every partition
  let offsets = costs
    .iter()
    .scan(0, |offset, c| {
      let start = *offset;
      *offset += c.sites;
      Some(start)
    })
    .collect_vec();

  let mut boundaries = vec![0; num_workers + 1];
  boundaries[num_workers] = total_sites;

  let mut cursor = SiteCursor::new(costs);
  for (w, boundary) in boundaries.iter_mut().enumerate().take(num_workers).skip(1) {
    let target = total_cost * w as f64 / num_workers as f64;
    while let Some(next) = cursor.peek_cost() {
      if (cursor.cumulative + next - target).abs() < (cursor.cumulative - target).abs() {
        cursor.advance();
      } else {
        break;
      }
    }
    *boundary = cursor.position;
  }

  let mut workers = vec![vec![]; num_workers];
  for (c, &offset) in costs.iter().zip(&offsets) {
    if c.sites == 0 {
      let owner = (0..num_workers).rev().find(|&w| boundaries[w] <= offset).unwrap_or(0);
      workers[owner].push(PartitionRange {
        partition: c.partition,
        start: 0,
        length: 0,
        master: true,
      });
      continue;
    }

    let mut master = true;
    for w in 0..num_workers {
      let start = boundaries[w].max(offset);
      let end = boundaries[w + 1].min(offset + c.sites);
      if start < end {
        workers[w].push(PartitionRange {
          partition: c.partition,
          start: start - offset,
          length: end - start,
          master,
        });
        master = false;
      }
    }
  }

  for (w, ranges) in workers.iter().enumerate() {
    if ranges.iter().all(|r| r.length == 0) {
      warn!("Worker #{w} has no alignment sites assigned. Consider using fewer workers.");
    }
  }

  let assignment = Assignment { workers };
  debug!("Data distribution:\n{assignment}");
  Ok(assignment)
}

/// Balances only the sites with non-zero weight (e.g. of a bootstrap replicate) and expresses the result in the
/// original site coordinates.
///
/// Every range is then extended up to the start of the next range of the same partition, so that zero-weight sites
/// are owned too and the ranges still cover every partition exactly.
pub fn balance_weighted(
  costs: &[PartitionSiteCost],
  weights: &[Vec<u32>],
  num_workers: usize,
) -> Result<Assignment, Report> {
  if weights.len() != costs.len() {
    return make_error!(
      "Expected site weights for {} partitions, but found {}",
      costs.len(),
      weights.len()
    );
  }

  let position_maps = costs
    .iter()
    .zip(weights)
    .map(|(c, site_weights)| {
      if site_weights.len() != c.sites {
        return make_error!(
          "Partition #{}: expected {} site weights, but found {}",
          c.partition,
          c.sites,
          site_weights.len()
        );
      }
      Ok(site_weights.iter().positions(|&w| w > 0).collect_vec())
    })
    .collect::<Result<Vec<_>, Report>>()?;

  let reduced = costs
    .iter()
    .zip(&position_maps)
    .map(|(c, map)| PartitionSiteCost { sites: map.len(), ..*c })
    .collect_vec();

  let mut assignment = balance(&reduced, num_workers)?;

  for (c, map) in costs.iter().zip(&position_maps) {
    let partition = c.partition;
    let mut owners = assignment
      .workers
      .iter()
      .enumerate()
      .flat_map(|(w, ranges)| {
        ranges
          .iter()
          .positions(move |r| r.partition == partition)
          .map(move |i| (w, i))
      })
      .collect_vec();
    owners.sort_by_key(|&(w, i)| (assignment.workers[w][i].start, w));

    let starts = owners
      .iter()
      .enumerate()
      .map(|(k, &(w, i))| if k == 0 { 0 } else { map[assignment.workers[w][i].start] })
      .collect_vec();

    for (k, &(w, i)) in owners.iter().enumerate() {
      let end = starts.get(k + 1).copied().unwrap_or(c.sites);
      let range = &mut assignment.workers[w][i];
      range.start = starts[k];
      range.length = end - starts[k];
    }
  }

  Ok(assignment)
}

/// Walks sites of all partitions in order, tracking the cumulative cost
struct SiteCursor<'a> {
  costs: &'a [PartitionSiteCost],
  partition: usize,
  offset: usize,
  position: usize,
  cumulative: f64,
}

impl<'a> SiteCursor<'a> {
  fn new(costs: &'a [PartitionSiteCost]) -> Self {
    Self {
      costs,
      partition: 0,
      offset: 0,
      position: 0,
      cumulative: 0.0,
    }
  }

  fn peek_cost(&mut self) -> Option<f64> {
    while self.partition < self.costs.len() && self.offset >= self.costs[self.partition].sites {
      self.partition += 1;
      self.offset = 0;
    }
    self.costs.get(self.partition).map(|c| c.site_cost)
  }

  fn advance(&mut self) {
    if let Some(cost) = self.peek_cost() {
      self.cumulative += cost;
      self.offset += 1;
      self.position += 1;
    }
  }
}
