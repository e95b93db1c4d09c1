//! Storage configuration: disks, partitions and filesystem settings.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Storage {
    pub boot_type: BootType,
    #[serde(default)]
    pub disks: Vec<Disk>,
    #[serde(default)]
    pub file_systems: Vec<FileSystem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BootType {
    Efi,
    Legacy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTableType {
    Gpt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BootPartitionType {
    Esp,
    BiosGrub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSystemType {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Fat32,
    Vfat,
    Swap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountIdentifierType {
    Uuid,
    PartUuid,
    PartLabel,
    #[default]
    Default,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Disk {
    pub partition_table_type: PartitionTableType,
    /// Size of the disk in mebibytes.
    pub max_size: u64,
    #[serde(default)]
    pub partitions: Vec<Partition>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Partition {
    /// Correlates this partition with a `FileSystem` entry.
    pub id: String,
    /// Offset from the start of the disk, in mebibytes.
    pub start: u64,
    #[serde(default)]
    pub end: Option<u64>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub boot_partition_type: Option<BootPartitionType>,
    #[serde(default)]
    pub fs_type: Option<FileSystemType>,
}

/// Formatting and mounting settings for one partition.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FileSystem {
    pub device_id: String,
    pub fs_type: FileSystemType,
    #[serde(default)]
    pub mount_identifier_type: MountIdentifierType,
    #[serde(default)]
    pub options: String,
    #[serde(default)]
    pub path: String,
}

impl Storage {
    pub fn is_valid(&self) -> Result<()> {
        if self.disks.is_empty() {
            bail!("at least 1 disk must be specified (or the storage field should be omitted)");
        }
        if self.disks.len() > 1 {
            bail!("multiple disks is not currently supported");
        }

        for (i, disk) in self.disks.iter().enumerate() {
            disk.is_valid()
                .with_context(|| format!("invalid disk at index {i}"))?;
        }

        let mut device_ids = HashSet::new();
        for (i, file_system) in self.file_systems.iter().enumerate() {
            file_system
                .is_valid()
                .with_context(|| format!("invalid fileSystems item at index {i}"))?;

            if !device_ids.insert(file_system.device_id.as_str()) {
                bail!(
                    "duplicate fileSystems deviceId used ({}) at index {i}",
                    file_system.device_id
                );
            }

            if self.find_partition(&file_system.device_id).is_none() {
                bail!(
                    "invalid fileSystems item at index {i}: no partition with matching ID ({})",
                    file_system.device_id
                );
            }
        }

        // Boot partitions live on fat32: the firmware (or the stage-1 grub)
        // can't read anything else.
        for disk in &self.disks {
            for partition in &disk.partitions {
                let Some(boot_type) = partition.boot_partition_type else {
                    continue;
                };
                let file_system = self
                    .file_systems
                    .iter()
                    .find(|fs| fs.device_id == partition.id);
                if let Some(file_system) = file_system {
                    if file_system.fs_type != FileSystemType::Fat32 {
                        let name = match boot_type {
                            BootPartitionType::Esp => "esp",
                            BootPartitionType::BiosGrub => "bios-grub",
                        };
                        bail!(
                            "'{name}' partition ({}) must use 'fat32' file system",
                            partition.id
                        );
                    }
                }
            }
        }

        // Ensure the correct partition exists to support the boot type.
        match self.boot_type {
            BootType::Efi => {
                if !self.has_boot_partition(BootPartitionType::Esp) {
                    bail!("'esp' partition must be provided for 'efi' boot type");
                }
            }
            BootType::Legacy => {
                if !self.has_boot_partition(BootPartitionType::BiosGrub) {
                    bail!("'bios-grub' partition must be provided for 'legacy' boot type");
                }
            }
        }

        Ok(())
    }

    fn find_partition(&self, device_id: &str) -> Option<&Partition> {
        self.disks
            .iter()
            .flat_map(|disk| disk.partitions.iter())
            .find(|partition| partition.id == device_id)
    }

    fn has_boot_partition(&self, boot_type: BootPartitionType) -> bool {
        self.disks
            .iter()
            .flat_map(|disk| disk.partitions.iter())
            .any(|partition| partition.boot_partition_type == Some(boot_type))
    }
}

impl Disk {
    pub fn is_valid(&self) -> Result<()> {
        if self.max_size == 0 {
            bail!("a disk's maxSize value must be a positive non-zero number");
        }

        let mut partition_ids = HashSet::new();
        for (i, partition) in self.partitions.iter().enumerate() {
            partition
                .is_valid()
                .with_context(|| format!("invalid partition at index {i}"))?;

            if !partition_ids.insert(partition.id.as_str()) {
                bail!("duplicate partition id used ({}) at index {i}", partition.id);
            }
        }

        Ok(())
    }
}

impl Partition {
    pub fn is_valid(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("a partition's id may not be empty");
        }

        match (self.end, self.size) {
            (Some(_), Some(_)) => {
                bail!("cannot specify both end and size on partition ({})", self.id)
            }
            (Some(0), None) | (None, Some(0)) => {
                bail!("partition's ({}) size may not be 0", self.id)
            }
            (Some(end), None) if end <= self.start => bail!(
                "partition's ({}) end ({end}) must be after its start ({})",
                self.id,
                self.start
            ),
            _ => {}
        }

        if let Some(label) = &self.label {
            label_check(label)
                .with_context(|| format!("invalid label on partition ({})", self.id))?;
        }

        Ok(())
    }
}

/// GPT stores partition names as 72 bytes of UTF-16 (35 characters plus a
/// null), and parted works best with ASCII.
fn label_check(label: &str) -> Result<()> {
    const MAX_LABEL_CHARS: usize = 35;

    for (pos, ch) in label.chars().enumerate() {
        if !ch.is_ascii() {
            bail!("label ({label}) contains a non-ASCII character '{ch}' at position ({pos})");
        }
    }

    if label.chars().count() > MAX_LABEL_CHARS {
        bail!("label ({label}) is too long: GPT labels hold at most {MAX_LABEL_CHARS} characters");
    }

    Ok(())
}

impl FileSystem {
    pub fn is_valid(&self) -> Result<()> {
        if self.device_id.is_empty() {
            bail!("a fileSystem's deviceId may not be empty");
        }

        if !self.path.is_empty() && !self.path.starts_with('/') {
            bail!("target path ({}) must be an absolute path", self.path);
        }

        Ok(())
    }
}
