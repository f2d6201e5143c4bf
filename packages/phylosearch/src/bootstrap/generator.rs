use crate::alignment::msa::PartitionedMsa;
use crate::utils::random::get_random_number_generator;
use itertools::Itertools;
use rand::Rng;

/// Pattern weights of one bootstrap replicate, per partition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapReplicate {
  pub seed: u64,
  pub site_weights: Vec<Vec<u32>>,
}

/// Resamples alignment sites with replacement, separately in every partition
#[derive(Clone, Copy, Debug, Default)]
pub struct BootstrapGenerator;

impl BootstrapGenerator {
  pub fn generate(&self, msa: &PartitionedMsa, seed: u64) -> BootstrapReplicate {
    let mut rng = get_random_number_generator(Some(seed));
    let site_weights = msa
      .partitions
      .iter()
      .map(|partition| {
        // Every original site, as the index of its pattern
        let sites = partition
          .msa
          .weights
          .iter()
          .enumerate()
          .flat_map(|(pattern, &weight)| std::iter::repeat(pattern).take(weight as usize))
          .collect_vec();

        let mut weights = vec![0_u32; partition.msa.num_patterns()];
        for _ in 0..sites.len() {
          weights[sites[rng.gen_range(0..sites.len())]] += 1;
        }
        weights
      })
      .collect_vec();

    BootstrapReplicate { seed, site_weights }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::fasta::read_many_fasta_str;
  use eyre::Report;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn msa() -> Result<PartitionedMsa, Report> {
    let records = read_many_fasta_str(
      ">a\nACGTACGTAA\n>b\nACGTACGTAC\n>c\nACGAACGTAG\n>d\nTCGTACGTAT\n",
    )?;
    PartitionedMsa::from_records_single(&records, "JC")
  }

  #[rstest]
  fn preserves_number_of_sites() -> Result<(), Report> {
    let msa = msa()?;
    let replicate = BootstrapGenerator.generate(&msa, 42);
    let total: u32 = replicate.site_weights[0].iter().sum();
    assert_eq!(total as usize, msa.partitions[0].msa.num_sites());
    assert_eq!(replicate.site_weights[0].len(), msa.partitions[0].msa.num_patterns());
    Ok(())
  }

  #[rstest]
  fn is_reproducible_for_a_seed() -> Result<(), Report> {
    let msa = msa()?;
    assert_eq!(BootstrapGenerator.generate(&msa, 7), BootstrapGenerator.generate(&msa, 7));
    Ok(())
  }
}
