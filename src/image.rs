//! Connection to a raw disk image: loopback device, partition mounts and
//! the staged chroot.

use anyhow::{bail, Context, Result};
use regex::Regex;
use rustix::mount::MountFlags;
use std::fs;
use std::path::Path;
use tracing::warn;

use crate::chroot::Chroot;
use crate::disk::{self, LoopbackDevice, PartitionInfo};
use crate::mount::MountHandle;

const BOOT_PARTITION_DIR_NAME: &str = "bootpartition";
const GRUB_CONFIG_REL_PATH: &str = "boot/grub2/grub.cfg";

/// Matches the grub directive that names the root filesystem.
const ROOTFS_SEARCH_PATTERN: &str = r"(?m)^search -n -u ([a-zA-Z0-9\-]+) -s$";

/// An opened disk image: the loopback attachment, the mounted partitions
/// (root first) and the staged chroot directory.
///
/// Teardown releases the mounts in reverse order, then detaches the
/// loopback; the loopback is detached even if a mount failed to release.
pub struct ImageConnection {
    loopback: LoopbackDevice,
    chroot: Chroot,
    mounts: Vec<MountHandle>,
}

/// Attach a raw image file and mount its partitions into a chroot tree
/// under `<build_dir>/<chroot_dir_name>`.
pub fn connect_to_existing_image(
    image_file: &Path,
    build_dir: &Path,
    chroot_dir_name: &str,
) -> Result<ImageConnection> {
    let mut loopback = disk::attach_loopback(image_file)?;

    match connect_helper(&loopback, build_dir, chroot_dir_name) {
        Ok((chroot, mounts)) => Ok(ImageConnection {
            loopback,
            chroot,
            mounts,
        }),
        Err(err) => {
            if let Err(detach_err) = loopback.detach() {
                warn!("failed to detach loopback after failed connect: {detach_err:#}");
            }
            Err(err)
        }
    }
}

fn connect_helper(
    loopback: &LoopbackDevice,
    build_dir: &Path,
    chroot_dir_name: &str,
) -> Result<(Chroot, Vec<MountHandle>)> {
    let partitions = disk::list_partitions(loopback.device_path())
        .context("failed to find disk partitions")?;

    let (boot_partition, boot_is_esp) = find_boot_partition(loopback, &partitions)?;
    let root_partition = find_root_partition(build_dir, boot_partition, &partitions)?;

    let chroot_dir = build_dir.join(chroot_dir_name);
    let chroot = Chroot::new(&chroot_dir);

    let mut mounts: Vec<MountHandle> = Vec::new();
    if let Err(err) = stage_mounts(
        &mut mounts,
        &chroot,
        root_partition,
        boot_partition,
        boot_is_esp,
    ) {
        release_mounts(&mut mounts);
        return Err(err);
    }

    Ok((chroot, mounts))
}

/// Mount the root partition at the chroot, then the subordinate mounts.
/// Root must come first; everything else lands inside it.
fn stage_mounts(
    mounts: &mut Vec<MountHandle>,
    chroot: &Chroot,
    root_partition: &PartitionInfo,
    boot_partition: &PartitionInfo,
    boot_is_esp: bool,
) -> Result<()> {
    let root_fs_type = partition_fs_type(root_partition)?;
    let root_mount = MountHandle::new(
        &root_partition.path,
        chroot.root_dir(),
        root_fs_type,
        MountFlags::empty(),
        "",
        true,
    )
    .context("failed to mount root partition")?;
    mounts.push(root_mount);

    if boot_is_esp {
        let esp_fs_type = partition_fs_type(boot_partition)?;
        let esp_mount = MountHandle::new(
            &boot_partition.path,
            &chroot.host_path("boot/efi"),
            esp_fs_type,
            MountFlags::empty(),
            "",
            false,
        )
        .context("failed to mount EFI system partition at /boot/efi")?;
        mounts.push(esp_mount);
    }

    Ok(())
}

fn release_mounts(mounts: &mut Vec<MountHandle>) {
    while let Some(mut mount) = mounts.pop() {
        if let Err(err) = mount.close() {
            warn!(
                "failed to release mount ({}): {err:#}",
                mount.target().display()
            );
        }
    }
}

fn partition_fs_type(partition: &PartitionInfo) -> Result<&str> {
    partition.fs_type.as_deref().with_context(|| {
        format!(
            "partition ({}) has no detectable filesystem",
            partition.path.display()
        )
    })
}

/// Locate the boot partition: the EFI system partition by its type UUID,
/// or failing that a legacy boot partition (XBOOTLDR type or a `boot`
/// partition label). Returns the partition and whether it is an ESP.
fn find_boot_partition<'a>(
    loopback: &LoopbackDevice,
    partitions: &'a [PartitionInfo],
) -> Result<(&'a PartitionInfo, bool)> {
    let esp = partitions
        .iter()
        .find(|p| p.part_type_uuid.as_deref() == Some(disk::ESP_TYPE_UUID));
    if let Some(esp) = esp {
        return Ok((esp, true));
    }

    let legacy_boot = partitions.iter().find(|p| {
        p.part_type_uuid.as_deref() == Some(disk::XBOOTLDR_TYPE_UUID)
            || p.part_label.as_deref() == Some("boot")
    });
    if let Some(legacy_boot) = legacy_boot {
        return Ok((legacy_boot, false));
    }

    bail!(
        "failed to find EFI system partition ({})",
        loopback.device_path().display()
    )
}

/// Mount the boot partition read-only at a scratch location, extract the
/// root filesystem identifier from grub.cfg, and resolve it to a
/// partition. The scratch mount is closed before returning.
fn find_root_partition<'a>(
    build_dir: &Path,
    boot_partition: &PartitionInfo,
    partitions: &'a [PartitionInfo],
) -> Result<&'a PartitionInfo> {
    let boot_fs_type = partition_fs_type(boot_partition)?;
    let boot_dir = build_dir.join(BOOT_PARTITION_DIR_NAME);

    let mut boot_mount = MountHandle::new(
        &boot_partition.path,
        &boot_dir,
        boot_fs_type,
        MountFlags::RDONLY,
        "",
        true,
    )
    .context("failed to mount boot partition")?;

    let grub_config_path = boot_dir.join(GRUB_CONFIG_REL_PATH);
    let grub_config = fs::read_to_string(&grub_config_path)
        .with_context(|| format!("failed to read grub.cfg file ({})", grub_config_path.display()));

    let close_result = boot_mount
        .close()
        .context("failed to close boot partition mount");

    let grub_config = grub_config?;
    close_result?;

    let rootfs_uuid = extract_rootfs_uuid(&grub_config)?;

    partitions
        .iter()
        .find(|p| p.uuid.as_deref() == Some(rootfs_uuid.as_str()))
        .with_context(|| format!("failed to find partition with filesystem uuid ({rootfs_uuid})"))
}

fn extract_rootfs_uuid(grub_config: &str) -> Result<String> {
    let search_regex =
        Regex::new(ROOTFS_SEARCH_PATTERN).context("failed to compile rootfs search pattern")?;

    let captures = search_regex
        .captures(grub_config)
        .context("failed to find rootfs partition in grub.cfg file")?;
    let uuid = captures
        .get(1)
        .context("rootfs search match is missing its capture group")?;

    Ok(uuid.as_str().to_string())
}

impl ImageConnection {
    pub fn chroot(&self) -> &Chroot {
        &self.chroot
    }

    /// Release the partition mounts in reverse order, then detach the
    /// loopback. All steps are attempted; failures are aggregated.
    pub fn close(&mut self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        while let Some(mut mount) = self.mounts.pop() {
            if let Err(err) = mount.close() {
                errors.push(format!(
                    "failed to close mount ({}): {err:#}",
                    mount.target().display()
                ));
            }
        }

        if let Err(err) = self.loopback.detach() {
            errors.push(format!("{err:#}"));
        }

        if !errors.is_empty() {
            bail!("failed to close image connection:\n{}", errors.join("\n"));
        }

        Ok(())
    }
}

impl Drop for ImageConnection {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("image connection leaked during drop: {err:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_rootfs_uuid() {
        let grub_config = "set timeout=0\n\
                           search -n -u d36cfa53-e913-4606-9950-b83b0d07371a -s\n\
                           menuentry \"os\" {\n}\n";

        let uuid = extract_rootfs_uuid(grub_config).unwrap();
        assert_eq!(uuid, "d36cfa53-e913-4606-9950-b83b0d07371a");
    }

    #[test]
    fn test_extract_rootfs_uuid_requires_exact_line() {
        // An indented or extended line is not the directive we're after.
        let grub_config = "  search -n -u d36cfa53 -s\nsearch -n -u d36cfa53 -s --hint\n";

        assert!(extract_rootfs_uuid(grub_config).is_err());
    }
}
