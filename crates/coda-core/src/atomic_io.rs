use std::{fs, path::Path};

use anyhow::{bail, Context, Result};

use crate::ids::generate_id;

/// Replaces `path` with `content` through a sibling temp file and a rename.
///
/// Missing parent directories are created. The temp file is removed when the
/// rename fails.
pub fn write_text_atomic(path: &Path, content: &str) -> Result<()> {
    let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
        bail!("destination '{}' has no file name", path.display());
    };
    if path.is_dir() {
        bail!("destination '{}' is a directory", path.display());
    }

    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(directory)
        .with_context(|| format!("failed to create directory '{}'", directory.display()))?;

    let staging = directory.join(format!(".{file_name}.{}", generate_id("tmp")));
    fs::write(&staging, content)
        .with_context(|| format!("failed to stage '{}'", staging.display()))?;
    fs::rename(&staging, path).or_else(|error| {
        let _ = fs::remove_file(&staging);
        Err(error).with_context(|| format!("failed to move staged write into '{}'", path.display()))
    })
}
