//! Loopback attachment and partition discovery via the host disk
//! utilities.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::process::Cmd;

/// GPT type UUID of an EFI system partition.
pub const ESP_TYPE_UUID: &str = "c12a7328-f81f-11d2-ba4b-00a0c93ec93b";

/// GPT type UUID of an extended boot (XBOOTLDR) partition, used by legacy
/// boot layouts to hold /boot.
pub const XBOOTLDR_TYPE_UUID: &str = "bc13c2ff-59e6-4262-a352-b275fd6f7172";

/// A block device exposing a regular image file.
pub struct LoopbackDevice {
    device_path: PathBuf,
    attached: bool,
}

/// Attach `image_file` to a free loopback device with partition scanning
/// enabled.
pub fn attach_loopback(image_file: &Path) -> Result<LoopbackDevice> {
    let result = Cmd::new("losetup")
        .args(["--find", "--show", "--partscan"])
        .arg_path(image_file)
        .error_msg(format!(
            "failed to attach loopback device for ({})",
            image_file.display()
        ))
        .run()?;

    let device_path = PathBuf::from(result.stdout_trimmed());
    if device_path.as_os_str().is_empty() {
        bail!(
            "losetup did not report a loopback device for ({})",
            image_file.display()
        );
    }

    // Give udev a chance to create the partition device nodes before
    // anything tries to mount them.
    let _ = Cmd::new("udevadm").arg("settle").allow_fail().run();

    Ok(LoopbackDevice {
        device_path,
        attached: true,
    })
}

impl LoopbackDevice {
    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    /// Detach the loopback device. Idempotent.
    pub fn detach(&mut self) -> Result<()> {
        if self.attached {
            Cmd::new("losetup")
                .arg("--detach")
                .arg_path(&self.device_path)
                .error_msg(format!(
                    "failed to detach loopback device ({})",
                    self.device_path.display()
                ))
                .run()?;
            self.attached = false;
        }

        Ok(())
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        if self.attached {
            if let Err(err) = self.detach() {
                warn!("loopback device leaked during drop: {err:#}");
            }
        }
    }
}

/// A partition reported by the disk utility.
#[derive(Debug, Clone)]
pub struct PartitionInfo {
    pub path: PathBuf,
    pub fs_type: Option<String>,
    pub uuid: Option<String>,
    pub part_type_uuid: Option<String>,
    pub part_uuid: Option<String>,
    pub part_label: Option<String>,
}

/// Enumerate the partitions of a block device.
pub fn list_partitions(device: &Path) -> Result<Vec<PartitionInfo>> {
    let result = Cmd::new("lsblk")
        .args([
            "--json",
            "--output",
            "PATH,TYPE,FSTYPE,UUID,PARTTYPE,PARTUUID,PARTLABEL",
        ])
        .arg_path(device)
        .error_msg(format!("failed to list partitions of ({})", device.display()))
        .run()?;

    parse_lsblk_output(&result.stdout)
        .with_context(|| format!("failed to parse lsblk output for ({})", device.display()))
}

fn parse_lsblk_output(output: &str) -> Result<Vec<PartitionInfo>> {
    let parsed: LsblkOutput = serde_json::from_str(output)?;

    let mut partitions = Vec::new();
    for device in &parsed.blockdevices {
        collect_partitions(device, &mut partitions);
    }

    Ok(partitions)
}

fn collect_partitions(device: &LsblkDevice, partitions: &mut Vec<PartitionInfo>) {
    if device.kind.as_deref() == Some("part") {
        partitions.push(PartitionInfo {
            path: device.path.clone(),
            fs_type: device.fstype.clone(),
            uuid: device.uuid.clone(),
            part_type_uuid: device.parttype.clone(),
            part_uuid: device.partuuid.clone(),
            part_label: device.partlabel.clone(),
        });
    }

    for child in &device.children {
        collect_partitions(child, partitions);
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: PathBuf,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    fstype: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(default)]
    parttype: Option<String>,
    #[serde(default)]
    partuuid: Option<String>,
    #[serde(default)]
    partlabel: Option<String>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}
