use crate::io::file::open_file_or_stdin;
use crate::make_error;
use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::Path;

#[derive(Clone, Default, Debug, Deserialize, Serialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FastaRecord {
  pub seq_name: String,
  pub desc: Option<String>,
  pub seq: String,
  pub index: usize,
}

impl FastaRecord {
  pub fn clear(&mut self) {
    self.seq_name.clear();
    self.desc = None;
    self.seq.clear();
    self.index = 0;
  }

  pub fn is_empty(&self) -> bool {
    self.seq_name.is_empty() && self.seq.is_empty() && self.desc.is_none()
  }
}

pub struct FastaReader<'a> {
  reader: Box<dyn BufRead + 'a>,
  line: String,
  index: usize,
}

impl<'a> FastaReader<'a> {
  pub fn new(reader: Box<dyn BufRead + 'a>) -> Self {
    Self {
      reader,
      line: String::new(),
      index: 0,
    }
  }

  pub fn from_str(contents: &'a impl AsRef<str>) -> Self {
    Self::new(Box::new(contents.as_ref().as_bytes()))
  }

  pub fn from_path(filepath: impl AsRef<Path>) -> Result<Self, Report> {
    Ok(Self::new(open_file_or_stdin(&Some(filepath))?))
  }

  /// Reads the next non-empty line into the lookahead buffer. Returns false on end of input.
  fn next_line(&mut self) -> Result<bool, Report> {
    loop {
      self.line.clear();
      if self.reader.read_line(&mut self.line)? == 0 {
        return Ok(false);
      }
      let trimmed = self.line.trim();
      if !trimmed.is_empty() {
        self.line = trimmed.to_owned();
        return Ok(true);
      }
    }
  }

  /// Reads one record. On end of input the record is left empty.
  pub fn read(&mut self, record: &mut FastaRecord) -> Result<(), Report> {
    record.clear();

    if self.line.is_empty() && !self.next_line()? {
      return Ok(());
    }

    let Some(header) = self.line.strip_prefix('>') else {
      return make_error!("Expected character '>' at record start, but found: '{}'", self.line);
    };

    let mut parts = header.trim().splitn(2, char::is_whitespace);
    record.seq_name = parts.next().unwrap_or_default().to_owned();
    record.desc = parts.next().map(|desc| desc.trim().to_owned());

    loop {
      if !self.next_line()? {
        self.line.clear();
        break;
      }
      if self.line.starts_with('>') {
        break;
      }
      let fragment = self
        .line
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase());
      record.seq.extend(fragment);
    }

    record.index = self.index;
    self.index += 1;

    Ok(())
  }
}

pub fn read_many_fasta_str(contents: impl AsRef<str>) -> Result<Vec<FastaRecord>, Report> {
  let contents = contents.as_ref();
  let mut reader = FastaReader::from_str(&contents);
  read_all(&mut reader)
}

pub fn read_many_fasta(filepath: impl AsRef<Path>) -> Result<Vec<FastaRecord>, Report> {
  let filepath = filepath.as_ref();
  let mut reader = FastaReader::from_path(filepath)?;
  read_all(&mut reader).wrap_err_with(|| format!("When reading FASTA file '{}'", filepath.display()))
}

fn read_all(reader: &mut FastaReader) -> Result<Vec<FastaRecord>, Report> {
  let mut fasta_records = Vec::<FastaRecord>::new();
  loop {
    let mut record = FastaRecord::default();
    reader.read(&mut record)?;
    if record.is_empty() {
      break;
    }
    fasta_records.push(record);
  }
  Ok(fasta_records)
}
