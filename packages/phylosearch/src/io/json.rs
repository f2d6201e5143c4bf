use crate::io::file::{create_file, open_file_or_stdin};
use crate::io::fs::write_file_atomic;
use eyre::{Report, WrapErr};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

pub fn json_read_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(filepath: P) -> Result<T, Report> {
  let filepath = filepath.as_ref();
  json_read(open_file_or_stdin(&Some(filepath))?)
    .wrap_err_with(|| format!("When reading JSON file: '{}'", filepath.display()))
}

pub fn json_read<T: for<'de> Deserialize<'de>>(reader: impl std::io::Read) -> Result<T, Report> {
  serde_json::from_reader(reader).wrap_err("When parsing JSON")
}

#[derive(Clone, Copy, Debug)]
pub struct JsonPretty(pub bool);

pub fn json_write_file<T: Serialize>(filepath: impl AsRef<Path>, obj: &T, pretty: JsonPretty) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  let mut file = create_file(filepath)?;
  json_write(&mut file, &obj, pretty).wrap_err_with(|| format!("When writing JSON file: '{}'", filepath.display()))?;
  file
    .flush()
    .wrap_err_with(|| format!("When writing JSON file: '{}'", filepath.display()))
}

/// Writes JSON through a temporary file and a rename, so that the destination is either the old or the new document
pub fn json_write_file_atomic<T: Serialize>(
  filepath: impl AsRef<Path>,
  obj: &T,
  pretty: JsonPretty,
) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  let data = json_write_str(obj, pretty)?;
  write_file_atomic(filepath, data).wrap_err_with(|| format!("When writing JSON file: '{}'", filepath.display()))
}

pub fn json_write_str<T: Serialize>(obj: &T, pretty: JsonPretty) -> Result<String, Report> {
  if pretty.0 {
    serde_json::to_string_pretty(obj)
  } else {
    serde_json::to_string(obj)
  }
  .wrap_err("When writing JSON string")
}

pub fn json_write<W: Write, T: Serialize>(writer: W, obj: &T, pretty: JsonPretty) -> Result<(), Report> {
  if pretty.0 {
    serde_json::to_writer_pretty(writer, &obj)
  } else {
    serde_json::to_writer(writer, &obj)
  }
  .wrap_err("When writing JSON")
}
