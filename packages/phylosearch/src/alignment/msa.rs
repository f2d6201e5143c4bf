use crate::alignment::state::{encode_char, states_of, undetermined, StateSet};
use crate::io::fasta::{read_many_fasta, FastaRecord};
use crate::io::partition_file::{read_partition_file, PartitionDefinition, SiteInterval};
use crate::load_balancer::PartitionSiteCost;
use crate::make_error;
use crate::model::model::{FreqMode, Model};
use crate::model::parse::parse_model;
use crate::model::presets::{equal_freqs, DataType, SubstModel};
use eyre::{Report, WrapErr};
use itertools::Itertools;
use log::{info, warn};
use std::collections::HashMap;
use std::path::Path;

/// Pattern-compressed alignment of one partition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Msa {
  pub data_type: DataType,
  /// State sets indexed by taxon, then by pattern
  pub sequences: Vec<Vec<StateSet>>,
  pub weights: Vec<u32>,
}

impl Msa {
  /// Merges identical columns into patterns, in order of first occurrence. Fully undetermined columns are dropped.
  pub fn from_columns(data_type: DataType, num_taxa: usize, columns: &[Vec<StateSet>]) -> Self {
    let gap = undetermined(data_type);
    let mut index = HashMap::<&[StateSet], usize>::new();
    let mut sequences = vec![vec![]; num_taxa];
    let mut weights = vec![];

    for column in columns {
      if column.iter().all(|&s| s == gap) {
        continue;
      }
      let next = weights.len();
      let pattern = *index.entry(column.as_slice()).or_insert(next);
      if pattern == next {
        for (seq, &state) in sequences.iter_mut().zip(column.iter()) {
          seq.push(state);
        }
        weights.push(0);
      }
      weights[pattern] += 1;
    }

    Self {
      data_type,
      sequences,
      weights,
    }
  }

  #[inline]
  pub fn num_patterns(&self) -> usize {
    self.weights.len()
  }

  pub fn num_sites(&self) -> usize {
    self.weights.iter().map(|&w| w as usize).sum()
  }

  /// A pattern is invariant if some state is compatible with every sequence
  pub fn is_invariant(&self, pattern: usize) -> bool {
    let all = undetermined(self.data_type);
    self.sequences.iter().fold(all, |acc, seq| acc & seq[pattern]) != 0
  }

  pub fn num_invariant_patterns(&self) -> usize {
    (0..self.num_patterns()).filter(|&p| self.is_invariant(p)).count()
  }

  /// Weighted state counts; ambiguous characters contribute evenly to each of their states
  pub fn empirical_freqs(&self) -> Vec<f64> {
    let n = self.data_type.num_states();
    let gap = undetermined(self.data_type);
    let mut counts = vec![0.0; n];
    for seq in &self.sequences {
      for (&set, &w) in seq.iter().zip(self.weights.iter()) {
        if set == gap {
          continue;
        }
        let states = states_of(set, n).collect_vec();
        let share = f64::from(w) / states.len() as f64;
        for s in states {
          counts[s] += share;
        }
      }
    }
    let total: f64 = counts.iter().sum();
    if total > 0.0 {
      counts.iter().map(|c| c / total).collect()
    } else {
      equal_freqs(self.data_type)
    }
  }
}

#[derive(Clone, Debug)]
pub struct PartitionInfo {
  pub name: String,
  pub model: Model,
  pub msa: Msa,
}

#[derive(Clone, Debug)]
pub struct PartitionedMsa {
  pub taxon_names: Vec<String>,
  pub partitions: Vec<PartitionInfo>,
}

impl PartitionedMsa {
  /// Single partition with the given model spanning every alignment column
  pub fn from_records_single(records: &[FastaRecord], model_str: &str) -> Result<Self, Report> {
    let length = records.first().map_or(0, |r| r.seq.chars().count());
    let definition = PartitionDefinition {
      name: "noname".to_owned(),
      model: model_str.to_owned(),
      intervals: vec![SiteInterval {
        start: 1,
        end: length.max(1),
        stride: 1,
      }],
    };
    Self::from_records(records, &[definition])
  }

  /// Reads a FASTA alignment, partitioned by a partition file or else as a single partition with the given model
  pub fn read(fasta: impl AsRef<Path>, model_str: &str, partition_file: Option<&Path>) -> Result<Self, Report> {
    let fasta = fasta.as_ref();
    let records = read_many_fasta(fasta)?;
    let msa = match partition_file {
      Some(partition_file) => Self::from_records(&records, &read_partition_file(partition_file)?),
      None => Self::from_records_single(&records, model_str),
    }
    .wrap_err_with(|| format!("When loading alignment '{}'", fasta.display()))?;

    let total_sites: usize = msa.partitions.iter().map(|p| p.msa.num_sites()).sum();
    info!(
      "Loaded alignment with {} taxa, {} partition(s), {total_sites} sites and {} patterns",
      msa.num_taxa(),
      msa.num_partitions(),
      msa.total_patterns()
    );
    Ok(msa)
  }

  pub fn from_records(records: &[FastaRecord], definitions: &[PartitionDefinition]) -> Result<Self, Report> {
    if records.is_empty() {
      return make_error!("Alignment is empty");
    }

    let length = records[0].seq.chars().count();
    if let Some(bad) = records.iter().find(|r| r.seq.chars().count() != length) {
      return make_error!(
        "All sequences must have the same length, but sequence '{}' has length {} (expected {length})",
        bad.seq_name,
        bad.seq.chars().count()
      );
    }

    let taxon_names = records.iter().map(|r| r.seq_name.clone()).collect_vec();
    let chars = records.iter().map(|r| r.seq.chars().collect_vec()).collect_vec();

    let partitions = definitions
      .iter()
      .map(|definition| {
        Self::build_partition(definition, &chars, length)
          .wrap_err_with(|| format!("When building partition '{}'", definition.name))
      })
      .collect::<Result<Vec<_>, Report>>()?;

    Ok(Self {
      taxon_names,
      partitions,
    })
  }

  fn build_partition(
    definition: &PartitionDefinition,
    chars: &[Vec<char>],
    length: usize,
  ) -> Result<PartitionInfo, Report> {
    let mut model = model_from_definition(&definition.model)?;
    let data_type = model.data_type();

    let sites = definition.sites();
    if let Some(site) = sites.iter().find(|&&s| s >= length) {
      return make_error!("Site {} is beyond the alignment length {length}", site + 1);
    }

    let columns = sites
      .iter()
      .map(|&site| {
        chars
          .iter()
          .map(|seq| encode_char(seq[site], data_type))
          .collect::<Result<Vec<_>, Report>>()
      })
      .collect::<Result<Vec<_>, Report>>()?;

    let msa = Msa::from_columns(data_type, chars.len(), &columns);

    let removed = sites.len() - msa.num_sites();
    if removed > 0 {
      warn!(
        "Partition '{}': {removed} fully undetermined column(s) will be ignored",
        definition.name
      );
    }

    init_freqs(&mut model, &msa);

    Ok(PartitionInfo {
      name: definition.name.clone(),
      model,
      msa,
    })
  }

  #[inline]
  pub fn num_taxa(&self) -> usize {
    self.taxon_names.len()
  }

  #[inline]
  pub fn num_partitions(&self) -> usize {
    self.partitions.len()
  }

  pub fn total_patterns(&self) -> usize {
    self.partitions.iter().map(|p| p.msa.num_patterns()).sum()
  }

  pub fn models(&self) -> Vec<Model> {
    self.partitions.iter().map(|p| p.model.clone()).collect()
  }

  pub fn original_weights(&self) -> Vec<Vec<u32>> {
    self.partitions.iter().map(|p| p.msa.weights.clone()).collect()
  }

  /// Per-partition pattern counts and computational cost of one pattern, in partition order
  pub fn site_costs(&self) -> Vec<PartitionSiteCost> {
    self
      .partitions
      .iter()
      .enumerate()
      .map(|(partition, p)| PartitionSiteCost {
        partition,
        sites: p.msa.num_patterns(),
        site_cost: p.model.site_cost(),
      })
      .collect()
  }
}

fn model_from_definition(model_str: &str) -> Result<Model, Report> {
  match model_str.trim().to_uppercase().as_str() {
    "DNA" => Ok(Model::new(SubstModel::Gtr)),
    "BIN" => Ok(Model::new(SubstModel::Mk)),
    _ => parse_model(model_str),
  }
}

/// Sets the starting frequencies. Zero empirical frequencies are clamped so that the model stays valid in force mode.
fn init_freqs(model: &mut Model, msa: &Msa) {
  model.freqs = match model.freq_mode {
    FreqMode::Equal => equal_freqs(msa.data_type),
    FreqMode::Empirical | FreqMode::MaxLikelihood => {
      let freqs = msa.empirical_freqs().into_iter().map(|f| f.max(1e-6)).collect_vec();
      let sum: f64 = freqs.iter().sum();
      freqs.into_iter().map(|f| f / sum).collect()
    }
  };
}

#[cfg(test)]
mod tests {
  use super::*;
  use approx::assert_ulps_eq;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  fn records(seqs: &[(&str, &str)]) -> Vec<FastaRecord> {
    seqs
      .iter()
      .enumerate()
      .map(|(index, (name, seq))| FastaRecord {
        seq_name: (*name).to_owned(),
        desc: None,
        seq: (*seq).to_owned(),
        index,
      })
      .collect()
  }

  #[rstest]
  fn compresses_patterns_in_order_of_first_occurrence() -> Result<(), Report> {
    let records = records(&[("a", "AACA-"), ("b", "AACC-"), ("c", "GGCA-"), ("d", "TTCA-")]);
    let msa = PartitionedMsa::from_records_single(&records, "JC")?;
    let msa = &msa.partitions[0].msa;
    assert_eq!(msa.weights, vec![2, 1, 1]);
    assert_eq!(msa.sequences[1], vec![1, 2, 2]);
    assert_eq!(msa.num_sites(), 4);
    assert!(msa.is_invariant(1) && !msa.is_invariant(0) && !msa.is_invariant(2));
    Ok(())
  }

  #[rstest]
  fn counts_ambiguous_states_fractionally() -> Result<(), Report> {
    let records = records(&[("a", "AR"), ("b", "AN"), ("c", "CG"), ("d", "TG")]);
    let msa = PartitionedMsa::from_records_single(&records, "GTR+FC")?;
    let freqs = msa.partitions[0].msa.empirical_freqs();
    assert_ulps_eq!(freqs[0], 2.5 / 7.0);
    assert_ulps_eq!(freqs[2], 2.5 / 7.0);
    assert_ulps_eq!(freqs[1], 1.0 / 7.0);
    Ok(())
  }

  #[rstest]
  fn splits_partitions() -> Result<(), Report> {
    let records = records(&[("a", "AC01"), ("b", "AC11"), ("c", "GT00"), ("d", "TT10")]);
    let definitions = crate::io::partition_file::parse_partitions("JC, p1 = 1-2\nBIN, p2 = 3-4")?;
    let msa = PartitionedMsa::from_records(&records, &definitions)?;
    assert_eq!(msa.num_partitions(), 2);
    assert_eq!(msa.partitions[1].msa.data_type, DataType::Binary);
    assert_eq!(msa.site_costs()[1].site_cost, 2.0);
    Ok(())
  }

  #[rstest]
  fn rejects_unequal_lengths() {
    let records = records(&[("a", "AC"), ("b", "A")]);
    assert!(PartitionedMsa::from_records_single(&records, "JC").is_err());
  }
}
