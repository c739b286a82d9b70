//! Top-level drivers: once-per-install encryption and once-per-boot unlock.

use crate::encryptor::EncryptionStrategy;
use crate::selector::get_encryptor;
use crate::{Encryptor, PartlockResult};
use log::{debug, info, warn};
use partlock_block::{disks, Disk, Paths};
use partlock_luks::{settle, UDEV_SETTLE_TIMEOUT};
use std::path::Path;

const LUKS_FS_TYPE: &str = "crypto_LUKS";

/// Encrypt the partitions carrying `labels` with the automatically selected
/// strategy. Returns the `label:name:uuid` triples for caller persistence.
pub fn encrypt_partitions(labels: &[String]) -> PartlockResult<Vec<String>> {
    let mut encryptor = get_encryptor()?;
    encryptor.encrypt(labels)
}

/// Unlock every locked LUKS partition with the automatically selected
/// strategy.
pub fn unlock_all() -> PartlockResult<()> {
    let mut encryptor = get_encryptor()?;
    unlock_all_with(&mut encryptor)
}

/// Unlock every locked LUKS partition with an already-built strategy.
///
/// A failed block scan is not fatal at boot: it is logged and treated as
/// "nothing to unlock". Zero locked partitions return success.
pub fn unlock_all_with(encryptor: &mut Encryptor) -> PartlockResult<()> {
    settle(UDEV_SETTLE_TIMEOUT)?;

    let paths = Paths::detect(None);
    let disks = match disks(&paths) {
        Ok(disks) => disks,
        Err(err) => {
            warn!("error reading partitions: {err}");
            return Ok(());
        }
    };

    let labels = collect_locked_labels(&disks, Path::new("/dev/mapper"));
    if labels.is_empty() {
        info!("no locked LUKS partitions found");
        return Ok(());
    }

    info!("unlocking {} partition(s) via {}", labels.len(), encryptor.name());
    encryptor.unlock(&labels)
}

/// Labels of LUKS partitions that are not mapped yet. Partitions without a
/// filesystem label cannot be driven by the label-based strategies and are
/// skipped.
fn collect_locked_labels(disks: &[Disk], mapper_dir: &Path) -> Vec<String> {
    let mut labels = Vec::new();
    for disk in disks {
        for partition in &disk.partitions {
            if partition.fs_type != LUKS_FS_TYPE {
                continue;
            }
            if mapper_dir.join(&partition.name).exists() {
                info!(
                    "device /dev/{} already mapped at {}, skipping",
                    partition.name,
                    mapper_dir.join(&partition.name).display()
                );
                continue;
            }
            if partition.filesystem_label.is_empty() {
                debug!("locked LUKS partition /dev/{} has no label, skipping", partition.name);
                continue;
            }
            info!("locked LUKS partition found at /dev/{}", partition.name);
            labels.push(partition.filesystem_label.clone());
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;
    use partlock_block::Partition;
    use std::fs;

    fn partition(name: &str, label: &str, fs_type: &str) -> Partition {
        Partition {
            name: name.to_string(),
            filesystem_label: label.to_string(),
            fs_type: fs_type.to_string(),
            path: format!("/dev/{name}"),
            ..Partition::default()
        }
    }

    fn single_disk(partitions: Vec<Partition>) -> Vec<Disk> {
        vec![Disk {
            name: "sda".to_string(),
            size_bytes: 0,
            uuid: String::new(),
            partitions,
        }]
    }

    #[test]
    fn collects_only_locked_labeled_luks_partitions() {
        let mapper = tempfile::tempdir().unwrap();
        fs::write(mapper.path().join("sda3"), "").unwrap();

        let disks = single_disk(vec![
            partition("sda1", "COS_GRUB", "ext4"),
            partition("sda2", "COS_PERSISTENT", LUKS_FS_TYPE),
            partition("sda3", "COS_OEM", LUKS_FS_TYPE),
            partition("sda4", "", LUKS_FS_TYPE),
        ]);

        let labels = collect_locked_labels(&disks, mapper.path());
        assert_eq!(labels, vec!["COS_PERSISTENT"]);
    }

    #[test]
    fn no_luks_partitions_collects_nothing() {
        let mapper = tempfile::tempdir().unwrap();
        let disks = single_disk(vec![partition("sda1", "COS_GRUB", "ext4")]);
        assert!(collect_locked_labels(&disks, mapper.path()).is_empty());
    }
}
