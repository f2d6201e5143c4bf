use eyre::{eyre, Report, WrapErr};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::{env, fs};

pub fn absolute_path(path: impl AsRef<Path>) -> Result<PathBuf, Report> {
  let path = path.as_ref();

  let absolute_path = if path.is_absolute() {
    path.to_path_buf()
  } else {
    env::current_dir()?.join(path)
  };

  Ok(absolute_path)
}

pub fn ensure_dir(filepath: impl AsRef<Path>) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  {
    let parent_dir = filepath
      .parent()
      .ok_or_else(|| eyre!("Unable to get parent path for '{}'", filepath.display()))?;

    let parent_path = absolute_path(parent_dir)?;

    fs::create_dir_all(&parent_path).wrap_err_with(|| format!("When creating directory '{}'", parent_path.display()))
  }
  .wrap_err_with(|| format!("When ensuring parent directory for '{}'", filepath.display()))
}

pub fn filename_maybe(filepath: impl AsRef<Path>) -> Option<String> {
  filepath.as_ref().file_name()?.to_str()?.to_owned().into()
}

pub fn read_file_to_string(filepath: impl AsRef<Path>) -> Result<String, Report> {
  let filepath = filepath.as_ref();
  let mut file = fs::File::open(filepath).wrap_err_with(|| format!("When opening file '{}'", filepath.display()))?;
  let mut data = String::new();
  file
    .read_to_string(&mut data)
    .wrap_err_with(|| format!("When reading file '{}'", filepath.display()))?;
  Ok(data)
}

/// Replaces the file contents in one step: the data goes to a sibling temporary file which is then renamed over
/// the destination, so that readers never observe a partially written file.
pub fn write_file_atomic(filepath: impl AsRef<Path>, data: impl AsRef<[u8]>) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  ensure_dir(filepath)?;

  let mut tmp_name = filepath.as_os_str().to_owned();
  tmp_name.push(".tmp");
  let tmp_path = PathBuf::from(tmp_name);

  fs::write(&tmp_path, data).wrap_err_with(|| format!("When writing file '{}'", tmp_path.display()))?;
  fs::rename(&tmp_path, filepath)
    .wrap_err_with(|| format!("When moving '{}' to '{}'", tmp_path.display(), filepath.display()))
}

pub fn remove_file_if_exists(filepath: impl AsRef<Path>) -> Result<(), Report> {
  let filepath = filepath.as_ref();
  if filepath.exists() {
    fs::remove_file(filepath).wrap_err_with(|| format!("When removing file '{}'", filepath.display()))?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  #[rstest]
  fn atomic_write_replaces_contents() -> Result<(), Report> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nested").join("run.ckp");

    write_file_atomic(&path, "first")?;
    write_file_atomic(&path, "second")?;

    assert_eq!(read_file_to_string(&path)?, "second");
    assert!(!dir.path().join("nested").join("run.ckp.tmp").exists());

    remove_file_if_exists(&path)?;
    remove_file_if_exists(&path)?;
    assert!(!path.exists());
    Ok(())
  }
}
