//! Partition lookup by filesystem label.

use crate::paths::Paths;
use crate::scan::disks;
use crate::types::Partition;
use crate::{BlockError, BlockResult};
use log::debug;
use std::process::Command;

/// Find a partition by filesystem label.
///
/// `blkid -L <label>` resolves the device node (it tracks freshly created
/// nodes faster than the udev database); the enumeration provides the full
/// partition record. When the enumerated record lacks a path the blkid one is
/// substituted, so a successful lookup always carries a non-empty `path`.
pub fn find_by_label(paths: &Paths, label: &str) -> BlockResult<Partition> {
    let device_path = blkid_lookup(label);
    if device_path.is_empty() {
        return Err(BlockError::PartitionNotFound(label.to_string()));
    }

    for disk in disks(paths)? {
        for mut partition in disk.partitions {
            if partition.filesystem_label == label {
                if partition.path.is_empty() {
                    partition.path = device_path;
                }
                return Ok(partition);
            }
        }
    }

    Err(BlockError::PartitionNotFound(label.to_string()))
}

/// Resolve a label to a device node via `blkid -L`, `None` when the label is
/// not (or not yet) visible to the block layer. Used both for lookup and for
/// verifying visibility after an unlock.
pub fn blkid_path(label: &str) -> Option<String> {
    let path = blkid_lookup(label);
    if path.is_empty() {
        None
    } else {
        Some(path)
    }
}

fn blkid_lookup(label: &str) -> String {
    let output = match Command::new("blkid").args(["-L", label]).output() {
        Ok(output) => output,
        Err(err) => {
            debug!("blkid invocation failed: {err}");
            return String::new();
        }
    };
    let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!(
        "blkid -L {label} exited {:?} with path `{path}`",
        output.status.code()
    );
    path
}
