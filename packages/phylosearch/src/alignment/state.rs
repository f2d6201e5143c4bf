use crate::make_error;
use crate::model::presets::DataType;
use eyre::Report;

/// Set of possible character states at one site of one sequence, as a bit mask
pub type StateSet = u32;

pub const fn undetermined(data_type: DataType) -> StateSet {
  (1 << data_type.num_states()) - 1
}

pub fn encode_char(c: char, data_type: DataType) -> Result<StateSet, Report> {
  match data_type {
    DataType::Dna => encode_nuc(c),
    DataType::Binary => encode_binary(c),
  }
}

fn encode_nuc(c: char) -> Result<StateSet, Report> {
  const A: StateSet = 1;
  const C: StateSet = 2;
  const G: StateSet = 4;
  const T: StateSet = 8;

  let states = match c.to_ascii_uppercase() {
    'A' => A,
    'C' => C,
    'G' => G,
    'T' | 'U' => T,
    'R' => A | G,
    'Y' => C | T,
    'S' => C | G,
    'W' => A | T,
    'K' => G | T,
    'M' => A | C,
    'B' => C | G | T,
    'D' => A | G | T,
    'H' => A | C | T,
    'V' => A | C | G,
    'N' | 'O' | 'X' | '-' | '?' | '.' => A | C | G | T,
    _ => return make_error!("Invalid nucleotide character: '{c}'"),
  };
  Ok(states)
}

fn encode_binary(c: char) -> Result<StateSet, Report> {
  match c {
    '0' => Ok(1),
    '1' => Ok(2),
    '-' | '?' | 'N' | 'n' => Ok(3),
    _ => make_error!("Invalid binary character: '{c}'"),
  }
}

/// Iterates over the states contained in a state set
pub fn states_of(set: StateSet, num_states: usize) -> impl Iterator<Item = usize> {
  (0..num_states).filter(move |&i| set & (1 << i) != 0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;
  use rstest::rstest;

  #[rstest]
  #[case('a', 1)]
  #[case('R', 5)]
  #[case('-', 15)]
  #[case('u', 8)]
  fn encodes_nucleotides(#[case] c: char, #[case] expected: StateSet) -> Result<(), Report> {
    assert_eq!(encode_char(c, DataType::Dna)?, expected);
    Ok(())
  }

  #[rstest]
  fn rejects_invalid_characters() {
    assert!(encode_char('J', DataType::Dna).is_err());
    assert!(encode_char('2', DataType::Binary).is_err());
  }

  #[rstest]
  fn lists_states() {
    assert_eq!(states_of(5, 4).collect::<Vec<_>>(), vec![0, 2]);
    assert_eq!(undetermined(DataType::Binary), 3);
  }
}
