//! Disk enumeration and multipath classification.
//!
//! Multipath parents surface their partitions as *top-level* `dm-*` entries
//! in `/sys/block`; those entries are attached to the parent via its
//! `holders/` directory and must never be reported as disks themselves.
//! Classification relies on the udev record alone: a `slaves/` directory is
//! not proof of multipath since every device-mapper target has slaves.

use crate::mounts::mount_info;
use crate::paths::Paths;
use crate::types::{Disk, Partition};
use crate::udevdb::{
    self, DM_NAME, DM_PART, DM_UUID, ID_FS_LABEL, ID_FS_TYPE, ID_PART_ENTRY_UUID,
    ID_PART_TABLE_UUID,
};
use crate::{BlockError, BlockResult};
use log::{debug, error};
use std::fs;

const SECTOR_SIZE: u64 = 512;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceClass {
    Regular,
    MultipathParent,
    MultipathPartition,
}

/// Enumerate all disks visible below the sys-block tree.
///
/// Unused loop devices (size zero) and multipath partitions are skipped;
/// partition-level I/O failures degrade to empty partition lists.
pub fn disks(paths: &Paths) -> BlockResult<Vec<Disk>> {
    debug!("scanning for disks under {}", paths.sys_block.display());
    let entries = fs::read_dir(&paths.sys_block).map_err(|source| BlockError::Scan {
        path: paths.sys_block.clone(),
        source,
    })?;

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut disks = Vec::new();
    for name in names {
        let size_bytes = device_size_bytes(paths, &name);

        if name.starts_with("loop") && size_bytes == 0 {
            continue;
        }

        let partitions = match classify(paths, &name) {
            DeviceClass::MultipathPartition => {
                debug!("skipping multipath partition {name}");
                continue;
            }
            DeviceClass::MultipathParent => multipath_partitions(paths, &name),
            DeviceClass::Regular => regular_partitions(paths, &name),
        };

        disks.push(Disk {
            uuid: udevdb::property(paths, &name, ID_PART_TABLE_UUID),
            name,
            size_bytes,
            partitions,
        });
    }

    Ok(disks)
}

/// Classify a top-level sys-block entry from its udev record.
fn classify(paths: &Paths, name: &str) -> DeviceClass {
    if !name.starts_with("dm-") {
        return DeviceClass::Regular;
    }
    let Ok(record) = udevdb::record_for_entry(paths, name) else {
        return DeviceClass::Regular;
    };
    let multipath = record
        .get(DM_UUID)
        .is_some_and(|uuid| uuid.contains("mpath"));
    if !multipath {
        return DeviceClass::Regular;
    }
    if record.contains_key(DM_PART) {
        DeviceClass::MultipathPartition
    } else {
        DeviceClass::MultipathParent
    }
}

/// Partitions of a regular disk: sysfs children whose name extends the disk
/// name, e.g. `sda1` below `sda`.
fn regular_partitions(paths: &Paths, disk: &str) -> Vec<Partition> {
    let disk_path = paths.sys_block.join(disk);
    let entries = match fs::read_dir(&disk_path) {
        Ok(entries) => entries,
        Err(err) => {
            error!("failed to read partitions of {disk}: {err}");
            return Vec::new();
        }
    };

    let backing_file = loop_backing_file(paths, disk);

    let mut names: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(disk))
        .collect();
    names.sort();

    let mut out = Vec::new();
    for name in names {
        let sys_entry = format!("{disk}/{name}");
        let size_bytes = device_size_bytes(paths, &sys_entry);
        let (mount_point, mut fs_type) = mount_info(paths, &name);
        let record = udevdb::record_for_entry(paths, &sys_entry).unwrap_or_default();
        if fs_type.is_empty() {
            // Unmounted partitions still expose their filesystem via udev.
            fs_type = record.get(ID_FS_TYPE).cloned().unwrap_or_default();
        }

        out.push(Partition {
            path: format!("/dev/{name}"),
            disk: format!("/dev/{disk}"),
            name,
            filesystem_label: record.get(ID_FS_LABEL).cloned().unwrap_or_default(),
            size: size_bytes / MIB,
            fs_type,
            uuid: record.get(ID_PART_ENTRY_UUID).cloned().unwrap_or_default(),
            mount_point,
            backing_file: backing_file.clone(),
        });
    }
    out
}

/// Partitions of a multipath parent: holders that are themselves multipath
/// partitions. Sizes come from the holder's own top-level sys-block entry.
fn multipath_partitions(paths: &Paths, disk: &str) -> Vec<Partition> {
    let holders_path = paths.sys_block.join(disk).join("holders");
    let holders = match fs::read_dir(&holders_path) {
        Ok(holders) => holders,
        Err(err) => {
            error!("failed to read holders of {disk}: {err}");
            return Vec::new();
        }
    };

    let mut names: Vec<String> = holders
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();

    let mut out = Vec::new();
    for name in names {
        if classify(paths, &name) != DeviceClass::MultipathPartition {
            debug!("holder {name} of {disk} is not a multipath partition");
            continue;
        }

        let record = match udevdb::record_for_entry(paths, &name) {
            Ok(record) => record,
            Err(err) => {
                error!("failed to read udev record for holder {name}: {err}");
                continue;
            }
        };
        let Some(mapper_name) = record.get(DM_NAME) else {
            error!("holder {name} of {disk} has no DM_NAME");
            continue;
        };

        let size_bytes = device_size_bytes(paths, &name);

        // The mount table may reference either the mapper alias or the raw
        // dm node.
        let candidates = [format!("/dev/mapper/{mapper_name}"), format!("/dev/{name}")];
        let mut mount_point = String::new();
        let mut fs_type = String::new();
        for candidate in &candidates {
            let (mp, ft) = mount_info(paths, candidate);
            if !mp.is_empty() {
                mount_point = mp;
                fs_type = ft;
                break;
            }
        }
        if fs_type.is_empty() {
            fs_type = record.get(ID_FS_TYPE).cloned().unwrap_or_default();
        }

        out.push(Partition {
            path: format!("/dev/{name}"),
            disk: format!("/dev/{disk}"),
            filesystem_label: record.get(ID_FS_LABEL).cloned().unwrap_or_default(),
            size: size_bytes / MIB,
            fs_type,
            uuid: record.get(ID_PART_ENTRY_UUID).cloned().unwrap_or_default(),
            mount_point,
            name,
            backing_file: None,
        });
    }
    out
}

/// Device size in bytes from the sysfs `size` file (512-byte sectors).
fn device_size_bytes(paths: &Paths, sys_entry: &str) -> u64 {
    let path = paths.sys_block.join(sys_entry).join("size");
    let contents = match fs::read_to_string(&path) {
        Ok(contents) => contents,
        Err(err) => {
            error!("failed to read {}: {err}", path.display());
            return 0;
        }
    };
    match contents.trim().parse::<u64>() {
        Ok(sectors) => sectors * SECTOR_SIZE,
        Err(err) => {
            error!("failed to parse {}: {err}", path.display());
            0
        }
    }
}

fn loop_backing_file(paths: &Paths, disk: &str) -> Option<String> {
    let path = paths.sys_block.join(disk).join("loop/backing_file");
    fs::read_to_string(path)
        .ok()
        .map(|contents| contents.trim().to_string())
        .filter(|contents| !contents.is_empty())
}
