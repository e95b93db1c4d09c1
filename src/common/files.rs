//! Utilities for file operations with automatic parent directory creation.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// Write a file, creating parent directories as needed.
pub fn write_file_with_dirs<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory ({})", parent.display()))?;
    }
    fs::write(path, content).with_context(|| format!("failed to write ({})", path.display()))?;
    Ok(())
}

/// Copy a file, creating the destination's parent directories as needed.
pub fn copy_file_with_dirs(src: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory ({})", parent.display()))?;
    }
    fs::copy(src, dest).with_context(|| {
        format!(
            "failed to copy ({}) to ({})",
            src.display(),
            dest.display()
        )
    })?;
    Ok(())
}

/// Set Unix permission bits on an existing file.
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to set permissions on ({})", path.display()))?;
    Ok(())
}

/// Replace a file's contents atomically: write a sibling temp file, then
/// rename it over the original.
pub fn replace_file<C: AsRef<[u8]>>(path: &Path, content: C) -> Result<()> {
    let mut temp_name = path.file_name().unwrap_or_default().to_os_string();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    fs::write(&temp_path, content)
        .with_context(|| format!("failed to write ({})", temp_path.display()))?;
    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename ({}) to ({})",
            temp_path.display(),
            path.display()
        )
    })?;
    Ok(())
}

/// Compute the SHA-256 hash of a file, as a lowercase hex string.
pub fn sha256_file(path: &Path) -> Result<String> {
    let content =
        fs::read(path).with_context(|| format!("failed to read ({})", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&content);
    Ok(format!("{:x}", hasher.finalize()))
}
