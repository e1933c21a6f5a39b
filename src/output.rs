//! # Output writing
//!
//! Atomic file placement for rendered secrets. Readers in the workload
//! container must never observe a half-written file, so every write goes
//! through a temp file in the destination directory, is flushed to disk,
//! and then renamed over the target. Mode is 0600 throughout.

use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::InjectionError;
use crate::render::RenderedFile;

/// Write one rendered file atomically, creating parent directories.
pub fn write_file(file: &RenderedFile) -> Result<(), InjectionError> {
    write_bytes(&file.path, &file.bytes)
}

/// Write all rendered files of one entry; stops at the first failure.
pub fn write_all(files: &[RenderedFile]) -> Result<(), InjectionError> {
    for file in files {
        write_file(file)?;
    }
    Ok(())
}

fn write_bytes(path: &Path, bytes: &[u8]) -> Result<(), InjectionError> {
    let parent = path.parent().ok_or_else(|| {
        InjectionError::ConfigInvalid(format!(
            "output path '{}' has no parent directory",
            path.display()
        ))
    })?;
    fs::create_dir_all(parent)?;

    // Temp file in the same directory so the rename stays on one filesystem.
    let mut temp = NamedTempFile::new_in(parent)?;
    temp.write_all(bytes)?;
    temp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    debug!(path = %path.display(), bytes = bytes.len(), "💾 Wrote output file");
    Ok(())
}
