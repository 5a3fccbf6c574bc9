use crate::error::DispatchError;

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::debug;

/// Reads a line-delimited file. Lines are trimmed and blank lines skipped.
pub fn load_lines(path: impl AsRef<Path>) -> Result<Vec<String>, DispatchError> {
  let path = path.as_ref();
  let load_error = |source| DispatchError::Load {
    path: path.to_path_buf(),
    source,
  };

  let file = File::open(path).map_err(load_error)?;
  let mut lines = Vec::new();
  for line in BufReader::new(file).lines() {
    let line = line.map_err(load_error)?;
    let line = line.trim();
    if !line.is_empty() {
      lines.push(line.to_string());
    }
  }

  debug!(path = %path.display(), count = lines.len(), "Loaded lines.");
  Ok(lines)
}
