//! Disk and partition records produced by enumeration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One partition as observed at scan time.
///
/// `name`, `path` and `disk` are fixed once the record is built; `path` is
/// always non-empty for records returned by label lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    /// Kernel basename, e.g. `sda1` or `dm-2`.
    #[serde(default)]
    pub name: String,

    /// Filesystem label, empty when the filesystem carries none.
    #[serde(default, rename = "label")]
    pub filesystem_label: String,

    /// Size in MiB.
    #[serde(default)]
    pub size: u64,

    /// Filesystem type (`ext4`, `crypto_LUKS`, ...), empty when unknown.
    #[serde(default, rename = "fs")]
    pub fs_type: String,

    /// Partition-entry UUID from the partition table.
    #[serde(default)]
    pub uuid: String,

    /// Mountpoint when currently mounted, empty otherwise.
    #[serde(default)]
    pub mount_point: String,

    /// Device node, e.g. `/dev/sda1`.
    #[serde(default)]
    pub path: String,

    /// Device node of the parent disk, e.g. `/dev/sda`.
    #[serde(default)]
    pub disk: String,

    /// Backing file when the partition lives on a loop device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing_file: Option<String>,
}

impl Partition {
    /// The `/dev/mapper` node this partition maps to once unlocked.
    pub fn mapper_path(&self) -> PathBuf {
        PathBuf::from("/dev/mapper").join(&self.name)
    }
}

/// One disk with its partitions, in sysfs order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Disk {
    /// Kernel basename, e.g. `sda` or `dm-0`.
    pub name: String,
    /// Size in bytes (512-byte sectors times 512).
    pub size_bytes: u64,
    /// Partition-table UUID, empty when unknown.
    pub uuid: String,
    pub partitions: Vec<Partition>,
}
