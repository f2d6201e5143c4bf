use crate::alignment::msa::PartitionedMsa;
use crate::load_balancer::AssignmentStats;
use crate::make_error;
use eyre::Report;
use log::warn;

/// Fewer normalized patterns per worker than this are a warning
const SOFT_MIN_PATTERNS: f64 = 600.0;

/// Fewer normalized patterns per worker than this are fatal, unless forced
const HARD_MIN_PATTERNS: f64 = 150.0;

/// Patterns per worker, normalized to the cost of DNA data. With few workers the synchronization overhead is lower,
/// so each pattern counts three times.
pub fn normalized_worker_patterns(msa: &PartitionedMsa, stats: &AssignmentStats) -> f64 {
  let states = msa
    .partitions
    .iter()
    .map(|p| p.model.num_states())
    .max()
    .unwrap_or(4);
  let factor = if stats.num_workers < 8 { 3.0 } else { 1.0 };
  stats.min_worker_sites as f64 * states as f64 / 4.0 * factor
}

pub fn suggested_workers(stats: &AssignmentStats) -> usize {
  (stats.total_sites as f64 / (2.0 * SOFT_MIN_PATTERNS)) as usize + 1
}

/// Checks that every worker gets enough alignment patterns to be worth its synchronization cost
pub fn check_resources(msa: &PartitionedMsa, stats: &AssignmentStats, force: bool) -> Result<(), Report> {
  if stats.num_workers <= 1 {
    return Ok(());
  }

  let patterns = normalized_worker_patterns(msa, stats);
  if patterns >= SOFT_MIN_PATTERNS {
    return Ok(());
  }

  let suggested = suggested_workers(stats);
  warn!(
    "Probably too many workers ({}) for an alignment with {} unique patterns. For best throughput use {suggested} \
     worker(s) and run starting trees or bootstrap replicates as separate jobs.",
    stats.num_workers, stats.total_sites
  );

  if patterns < HARD_MIN_PATTERNS {
    if force {
      warn!("Too few patterns per worker, continuing in force mode");
    } else {
      return make_error!(
        "Too few patterns per worker: at least {HARD_MIN_PATTERNS} (normalized) are needed, but found {patterns}. \
         Reduce the number of workers to {suggested} or use force mode to disable this check."
      );
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::fasta::read_many_fasta_str;
  use crate::load_balancer::balance;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn msa(length: usize) -> Result<PartitionedMsa, Report> {
    let fasta = ["a", "b", "c", "d"]
      .iter()
      .enumerate()
      .map(|(i, name)| {
        let seq = (0..length).map(|site| ['A', 'C', 'G', 'T'][(site + i * (site / 4)) % 4]).collect::<String>();
        format!(">{name}\n{seq}\n")
      })
      .collect::<String>();
    PartitionedMsa::from_records_single(&read_many_fasta_str(fasta)?, "JC")
  }

  #[rstest]
  fn single_worker_always_passes() -> Result<(), Report> {
    let msa = msa(8)?;
    let stats = balance(&msa.site_costs(), 1)?.stats();
    check_resources(&msa, &stats, false)?;
    Ok(())
  }

  #[rstest]
  fn too_few_patterns_are_fatal_unless_forced() -> Result<(), Report> {
    let msa = msa(40)?;
    let stats = balance(&msa.site_costs(), 4)?.stats();
    assert!(check_resources(&msa, &stats, false).is_err());
    check_resources(&msa, &stats, true)?;
    assert_eq!(suggested_workers(&stats), 1);
    Ok(())
  }
}
