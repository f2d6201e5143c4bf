use crate::io::fs::read_file_to_string;
use crate::make_error;
use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Inclusive 1-based site interval with a stride, as written in partition files (`1-100/3`)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInterval {
  pub start: usize,
  pub end: usize,
  pub stride: usize,
}

impl SiteInterval {
  /// 0-based site indices of this interval
  pub fn sites(&self) -> impl Iterator<Item = usize> {
    (self.start - 1..self.end).step_by(self.stride)
  }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDefinition {
  pub name: String,
  /// Either a data type (`DNA`, `BIN`) or a full model string
  pub model: String,
  pub intervals: Vec<SiteInterval>,
}

impl PartitionDefinition {
  pub fn sites(&self) -> Vec<usize> {
    self.intervals.iter().flat_map(SiteInterval::sites).collect()
  }
}

pub fn read_partition_file(filepath: impl AsRef<Path>) -> Result<Vec<PartitionDefinition>, Report> {
  let filepath = filepath.as_ref();
  let contents = read_file_to_string(filepath)?;
  parse_partitions(&contents).wrap_err_with(|| format!("When parsing partition file '{}'", filepath.display()))
}

/// Parses lines of the form `MODEL, name = 1-100, 201-300/3`
pub fn parse_partitions(contents: &str) -> Result<Vec<PartitionDefinition>, Report> {
  let mut partitions = vec![];
  for (i, line) in contents.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let partition = parse_partition_line(line).wrap_err_with(|| format!("When parsing line {}: '{line}'", i + 1))?;
    partitions.push(partition);
  }

  if partitions.is_empty() {
    return make_error!("No partitions defined");
  }

  Ok(partitions)
}

fn parse_partition_line(line: &str) -> Result<PartitionDefinition, Report> {
  let Some((head, ranges)) = line.split_once('=') else {
    return make_error!("Expected '=' between partition name and site ranges");
  };

  let Some((model, name)) = head.split_once(',') else {
    return make_error!("Expected 'MODEL, NAME' before '='");
  };

  let (model, name) = (model.trim(), name.trim());
  if model.is_empty() || name.is_empty() {
    return make_error!("Partition model and name must not be empty");
  }

  let intervals = ranges
    .split(',')
    .map(|range| parse_interval(range.trim()))
    .collect::<Result<Vec<_>, Report>>()?;

  Ok(PartitionDefinition {
    name: name.to_owned(),
    model: model.to_owned(),
    intervals,
  })
}

fn parse_interval(s: &str) -> Result<SiteInterval, Report> {
  let (range, stride) = match s.split_once('/') {
    Some((range, stride)) => (range, parse_position(stride)?),
    None => (s, 1),
  };

  let (start, end) = match range.split_once('-') {
    Some((start, end)) => (parse_position(start)?, parse_position(end)?),
    None => {
      let pos = parse_position(range)?;
      (pos, pos)
    }
  };

  if start == 0 || end < start || stride == 0 {
    return make_error!("Invalid site range: '{s}'");
  }

  Ok(SiteInterval { start, end, stride })
}

fn parse_position(s: &str) -> Result<usize, Report> {
  s.trim()
    .parse::<usize>()
    .wrap_err_with(|| format!("Invalid site position: '{s}'"))
}
