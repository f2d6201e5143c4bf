use crate::alignment::msa::PartitionedMsa;
use crate::alignment::state::undetermined;
use crate::model::model::{AscBias, FreqMode};
use crate::{make_error, make_report};
use eyre::Report;
use itertools::Itertools;
use log::warn;
use std::collections::HashMap;

pub const MIN_TAXA: usize = 4;

/// Load-time checks of the alignment and the models attached to it.
///
/// Problems that invalidate the analysis are errors. Force mode turns the ones that merely make it questionable
/// into warnings.
pub fn validate_msa(msa: &PartitionedMsa, force: bool) -> Result<(), Report> {
  let duplicates = msa.taxon_names.iter().duplicates().collect_vec();
  if !duplicates.is_empty() {
    return make_error!("Duplicate taxon names found in the alignment: {}", duplicates.iter().join(", "));
  }

  if msa.num_taxa() < 3 {
    return make_error!("Alignment must contain at least 3 taxa, but found {}", msa.num_taxa());
  }

  let mut errors = vec![];

  if msa.num_taxa() < MIN_TAXA {
    errors.push(make_report!(
      "Alignment contains only {} taxa, at least {MIN_TAXA} are needed for a tree search",
      msa.num_taxa()
    ));
  }

  for part in &msa.partitions {
    if part.msa.num_patterns() == 0 {
      errors.push(make_report!("Partition '{}' contains no informative sites", part.name));
    }

    if part.model.freq_mode == FreqMode::Empirical {
      let freqs = part.msa.empirical_freqs();
      if let Some(state) = freqs.iter().position(|&f| f <= 0.0) {
        errors.push(make_report!(
          "Partition '{}': frequency of state #{state} is zero. Use '+FE' or '+FO' instead of empirical frequencies.",
          part.name
        ));
      }
    }

    if part.model.asc_bias != AscBias::None {
      let invariant = part.msa.num_invariant_patterns();
      if invariant > 0 {
        errors.push(make_report!(
          "Partition '{}': {invariant} invariant site pattern(s) found, which is incompatible with ascertainment bias correction",
          part.name
        ));
      }
      if part.model.optimize_pinv {
        errors.push(make_report!(
          "Partition '{}': invariant sites model (+I) cannot be combined with ascertainment bias correction",
          part.name
        ));
      }
    }
  }

  report_warnings(msa);

  if errors.is_empty() {
    return Ok(());
  }

  if force {
    for error in &errors {
      warn!("{error} (ignored in force mode)");
    }
    Ok(())
  } else {
    let message = errors.iter().map(ToString::to_string).join("\n");
    make_error!("Alignment check failed:\n{message}")
  }
}

fn report_warnings(msa: &PartitionedMsa) {
  let num_taxa = msa.num_taxa();

  // Sequence of each taxon across all partitions
  let rows = (0..num_taxa)
    .map(|t| {
      msa
        .partitions
        .iter()
        .flat_map(|p| p.msa.weights.iter().zip(p.msa.sequences[t].iter()))
        .map(|(&w, &s)| (w, s))
        .collect_vec()
    })
    .collect_vec();

  let mut seen = HashMap::<&[(u32, u32)], usize>::new();
  for (t, row) in rows.iter().enumerate() {
    if let Some(&first) = seen.get(row.as_slice()) {
      warn!(
        "Sequences '{}' and '{}' are exactly identical",
        msa.taxon_names[first], msa.taxon_names[t]
      );
    } else {
      seen.insert(row.as_slice(), t);
    }
  }

  for t in 0..num_taxa {
    let fully_undetermined = msa
      .partitions
      .iter()
      .all(|p| p.msa.sequences[t].iter().all(|&s| s == undetermined(p.msa.data_type)));
    if fully_undetermined {
      warn!("Sequence '{}' consists entirely of undetermined values", msa.taxon_names[t]);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::io::fasta::read_many_fasta_str;
  use rstest::rstest;

  fn msa(fasta: &str, model: &str) -> Result<PartitionedMsa, Report> {
    PartitionedMsa::from_records_single(&read_many_fasta_str(fasta)?, model)
  }

  #[rstest]
  fn accepts_valid_alignment() -> Result<(), Report> {
    let msa = msa(">a\nACGTA\n>b\nACGTT\n>c\nAGGTC\n>d\nTCGAA\n", "GTR+G")?;
    validate_msa(&msa, false)
  }

  #[rstest]
  fn rejects_too_few_taxa_unless_forced() -> Result<(), Report> {
    let msa = msa(">a\nACGT\n>b\nACGA\n>c\nACGG\n", "GTR")?;
    assert!(validate_msa(&msa, false).is_err());
    validate_msa(&msa, true)
  }

  #[rstest]
  fn rejects_duplicate_names_even_if_forced() -> Result<(), Report> {
    let msa = msa(">a\nACGT\n>a\nACGA\n>c\nACGG\n>d\nACGC\n", "JC")?;
    assert!(validate_msa(&msa, true).is_err());
    Ok(())
  }

  #[rstest]
  fn rejects_zero_empirical_frequency() -> Result<(), Report> {
    let msa = msa(">a\nACA\n>b\nACC\n>c\nAGA\n>d\nCAG\n", "GTR+FC")?;
    assert!(validate_msa(&msa, false).is_err());
    Ok(())
  }

  #[rstest]
  fn rejects_invariant_sites_with_asc_bias() -> Result<(), Report> {
    let msa = msa(">a\n0011\n>b\n0101\n>c\n1001\n>d\n1101\n", "BIN+ASC_LEWIS")?;
    assert!(validate_msa(&msa, false).is_err());
    Ok(())
  }
}
