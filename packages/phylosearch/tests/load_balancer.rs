mod common;

use common::simulated_fasta;
use eyre::Report;
use itertools::Itertools;
use phylosearch::alignment::msa::PartitionedMsa;
use phylosearch::io::fasta::read_many_fasta_str;
use phylosearch::io::partition_file::parse_partitions;
use phylosearch::load_balancer::{balance, PartitionSiteCost};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use rstest::rstest;

fn max_site_cost(costs: &[PartitionSiteCost]) -> f64 {
  costs.iter().map(|c| c.site_cost).fold(0.0, f64::max)
}

fn total_cost(costs: &[PartitionSiteCost]) -> f64 {
  costs.iter().map(|c| c.sites as f64 * c.site_cost).sum()
}

#[rstest]
fn balances_two_partitions_with_different_models_over_three_workers() -> Result<(), Report> {
  let records = read_many_fasta_str(simulated_fasta(60, 0.1, 7))?;
  let definitions = parse_partitions("GTR+G, first = 1-40\nJC, second = 41-60\n")?;
  let msa = PartitionedMsa::from_records(&records, &definitions)?;
  let costs = msa.site_costs();
  assert_eq!(costs.len(), 2);

  let assignment = balance(&costs, 3)?;
  assignment.check_coverage(&costs.iter().map(|c| c.sites).collect_vec())?;

  let average = total_cost(&costs) / 3.0;
  let max_cost = max_site_cost(&costs);
  for rank in 0..3 {
    let cost = assignment.worker_cost(rank, &costs);
    assert!(
      (cost - average).abs() <= max_cost,
      "worker {rank}: cost {cost}, average {average}, max site cost {max_cost}"
    );
  }
  Ok(())
}

fn arb_costs() -> impl Strategy<Value = Vec<PartitionSiteCost>> {
  prop::collection::vec((0_usize..60, 1_u32..40), 1..6).prop_map(|parts| {
    parts
      .into_iter()
      .enumerate()
      .map(|(partition, (sites, cost))| PartitionSiteCost {
        partition,
        sites,
        site_cost: f64::from(cost),
      })
      .collect()
  })
}

proptest! {
  #[test]
  fn every_site_is_owned_exactly_once(costs in arb_costs(), num_workers in 1_usize..8) {
    let assignment = balance(&costs, num_workers).unwrap();
    let sizes = costs.iter().map(|c| c.sites).collect_vec();
    prop_assert!(assignment.check_coverage(&sizes).is_ok());
    prop_assert_eq!(assignment.num_workers(), num_workers);
  }

  #[test]
  fn worker_costs_stay_within_one_site_of_average(costs in arb_costs(), num_workers in 1_usize..8) {
    let assignment = balance(&costs, num_workers).unwrap();
    let average = total_cost(&costs) / num_workers as f64;
    let max_cost = max_site_cost(&costs);
    for rank in 0..num_workers {
      let cost = assignment.worker_cost(rank, &costs);
      prop_assert!((cost - average).abs() <= max_cost + 1e-9);
    }
  }

  #[test]
  fn balancing_is_deterministic(costs in arb_costs(), num_workers in 1_usize..8) {
    prop_assert_eq!(balance(&costs, num_workers).unwrap(), balance(&costs, num_workers).unwrap());
  }
}
