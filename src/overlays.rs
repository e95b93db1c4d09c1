//! OverlayFS mount declarations, applied through the image's fstab.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::DirBuilderExt;

use crate::chroot::Chroot;
use crate::common::files;
use crate::config::Overlay;
use crate::fstab::{self, FstabEntry};

const FSTAB_PATH: &str = "etc/fstab";
const DRACUT_OVERLAY_DROPIN: &str = "etc/dracut.conf.d/20-overlayfs.conf";
const OVERLAY_DIR_MODE: u32 = 0o755;

/// Append an fstab entry per overlay and precreate the upper and work
/// directories. Returns true when any overlay was installed, in which
/// case the caller must regenerate the initramfs.
pub fn handle_overlays(overlays: &[Overlay], chroot: &Chroot) -> Result<bool> {
    if overlays.is_empty() {
        return Ok(false);
    }

    // systemd mounts core-path fstab entries (e.g. /usr) during the
    // initramfs phase, so the overlay module must be available there.
    add_dracut_module("overlay", chroot)?;

    let fstab_path = chroot.host_path(FSTAB_PATH);
    let mut entries = fstab::read_fstab_file(&fstab_path).context("failed to read fstab file")?;

    for overlay in overlays {
        let mut options = overlay.options.clone();
        if !options.is_empty() {
            options.push(',');
        }
        options.push_str(&format!(
            "lowerdir={},upperdir={},workdir={}",
            overlay.lower, overlay.upper, overlay.work
        ));

        entries.push(FstabEntry {
            source: "overlay".to_string(),
            target: overlay.target.clone(),
            fs_type: "overlay".to_string(),
            options,
            freq: 0,
            pass_no: 2,
        });

        create_overlay_directory(chroot, &overlay.upper)
            .context("failed to create overlay upper directory")?;
        create_overlay_directory(chroot, &overlay.work)
            .context("failed to create overlay work directory")?;
    }

    fstab::write_fstab_file(&entries, &fstab_path).context("failed to write fstab file")?;

    Ok(true)
}

fn create_overlay_directory(chroot: &Chroot, path: &str) -> Result<()> {
    let host_path = chroot.host_path(path);
    fs::DirBuilder::new()
        .recursive(true)
        .mode(OVERLAY_DIR_MODE)
        .create(&host_path)
        .with_context(|| format!("failed to create directory ({})", host_path.display()))?;
    // mkdir modes pass through the umask; pin the final directory.
    files::set_mode(&host_path, OVERLAY_DIR_MODE)?;
    Ok(())
}

fn add_dracut_module(module: &str, chroot: &Chroot) -> Result<()> {
    let content = format!("add_dracutmodules+=\" {module} \"\n");
    files::write_file_with_dirs(chroot.host_path(DRACUT_OVERLAY_DROPIN), content)
        .context("failed to configure dracut overlay module")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn overlay() -> Overlay {
        Overlay {
            lower: "/usr".to_string(),
            upper: "/overlays/usr/upper".to_string(),
            work: "/overlays/usr/work".to_string(),
            target: "/usr".to_string(),
            options: "x-initrd.mount".to_string(),
        }
    }

    fn stage_chroot() -> (tempfile::TempDir, Chroot) {
        let dir = tempfile::tempdir().unwrap();
        let chroot = Chroot::new(dir.path());
        fs::create_dir_all(chroot.host_path("etc")).unwrap();
        fs::write(
            chroot.host_path(FSTAB_PATH),
            "UUID=d36cfa53 / ext4 defaults 1 1\n",
        )
        .unwrap();
        (dir, chroot)
    }

    #[test]
    fn test_appends_fstab_entry_and_creates_directories() {
        let (_dir, chroot) = stage_chroot();

        let rebuild = handle_overlays(&[overlay()], &chroot).unwrap();
        assert!(rebuild);

        let fstab = fs::read_to_string(chroot.host_path(FSTAB_PATH)).unwrap();
        assert!(fstab.starts_with("UUID=d36cfa53 / ext4 defaults 1 1\n"));
        assert!(fstab.contains(
            "overlay /usr overlay \
             x-initrd.mount,lowerdir=/usr,upperdir=/overlays/usr/upper,workdir=/overlays/usr/work \
             0 2\n"
        ));

        for path in ["/overlays/usr/upper", "/overlays/usr/work"] {
            let metadata = fs::metadata(chroot.host_path(path)).unwrap();
            assert!(metadata.is_dir());
            assert_eq!(metadata.permissions().mode() & 0o777, 0o755, "{path}");
        }

        let dropin = fs::read_to_string(chroot.host_path(DRACUT_OVERLAY_DROPIN)).unwrap();
        assert_eq!(dropin, "add_dracutmodules+=\" overlay \"\n");
    }

    #[test]
    fn test_empty_options_omit_leading_comma() {
        let (_dir, chroot) = stage_chroot();
        let mut entry = overlay();
        entry.options = String::new();

        handle_overlays(&[entry], &chroot).unwrap();

        let fstab = fs::read_to_string(chroot.host_path(FSTAB_PATH)).unwrap();
        assert!(fstab.contains("overlay /usr overlay lowerdir=/usr,"));
    }

    #[test]
    fn test_no_overlays_is_a_no_op() {
        let (_dir, chroot) = stage_chroot();

        let rebuild = handle_overlays(&[], &chroot).unwrap();

        assert!(!rebuild);
        assert!(!chroot.host_path(DRACUT_OVERLAY_DROPIN).exists());
    }
}
