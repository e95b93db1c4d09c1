//! Scoped kernel mounts that are released on every exit path.

use anyhow::{bail, Context, Result};
use rustix::mount::{mount, unmount, MountFlags, UnmountFlags};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A single kernel mount, owned for the duration of its use.
///
/// Created live in the same call that performs the mount. `close` is
/// idempotent and safe to call after a failed acquisition; a handle that
/// is dropped while still live closes itself and logs the error instead
/// of masking whatever unwound the stack.
#[derive(Debug)]
pub struct MountHandle {
    target: PathBuf,
    is_mounted: bool,
    dir_created: bool,
}

impl MountHandle {
    /// Mount `source` at `target`, optionally creating the target
    /// directory first. On failure, anything created is cleaned up.
    pub fn new(
        source: &Path,
        target: &Path,
        fs_type: &str,
        flags: MountFlags,
        data: &str,
        create_target_dir: bool,
    ) -> Result<MountHandle> {
        let mut handle = MountHandle {
            target: target.to_path_buf(),
            is_mounted: false,
            dir_created: false,
        };

        if let Err(err) = handle.acquire(source, fs_type, flags, data, create_target_dir) {
            if let Err(cleanup_err) = handle.close() {
                warn!("failed to clean up failed mount: {cleanup_err:#}");
            }
            return Err(err);
        }

        Ok(handle)
    }

    fn acquire(
        &mut self,
        source: &Path,
        fs_type: &str,
        flags: MountFlags,
        data: &str,
        create_target_dir: bool,
    ) -> Result<()> {
        debug!(
            "Mounting: source ({}), target ({}), fstype ({}), flags ({:?}), data ({})",
            source.display(),
            self.target.display(),
            fs_type,
            flags,
            data
        );

        if create_target_dir {
            fs::create_dir_all(&self.target).with_context(|| {
                format!("failed to create mount directory ({})", self.target.display())
            })?;
            self.dir_created = true;
        }

        mount(source, self.target.as_path(), fs_type, flags, data).with_context(|| {
            format!(
                "failed to mount ({}) to ({})",
                source.display(),
                self.target.display()
            )
        })?;
        self.is_mounted = true;

        Ok(())
    }

    /// The mount point path.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Unmount and remove the created mount directory.
    ///
    /// Idempotent; both steps are attempted even if the first fails, and
    /// the failures are aggregated.
    pub fn close(&mut self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.is_mounted {
            debug!("Unmounting ({})", self.target.display());
            match unmount(self.target.as_path(), UnmountFlags::empty()) {
                Ok(()) => self.is_mounted = false,
                Err(err) => errors.push(format!(
                    "failed to unmount ({}): {}",
                    self.target.display(),
                    err
                )),
            }
        }

        if self.dir_created {
            // Never remove recursively: if the unmount silently failed, a
            // recursive delete would reach through into the mounted tree.
            match fs::remove_dir(&self.target) {
                Ok(()) => self.dir_created = false,
                Err(err) => errors.push(format!(
                    "failed to delete mount directory ({}): {}",
                    self.target.display(),
                    err
                )),
            }
        }

        if !errors.is_empty() {
            bail!(errors.join("\n"));
        }

        Ok(())
    }
}

impl Drop for MountHandle {
    fn drop(&mut self) {
        if self.is_mounted || self.dir_created {
            if let Err(err) = self.close() {
                warn!("mount handle leaked during drop: {err:#}");
            }
        }
    }
}
