//! Access to the udev runtime database.
//!
//! Block devices are keyed as `b<MAJOR>:<MINOR>` under `run/udev/data`; each
//! record is a line-oriented file where `E:KEY=VALUE` lines carry device
//! properties. Anything else (`I:`, `G:`, comments) is ignored.

use crate::paths::Paths;
use log::trace;
use std::collections::HashMap;
use std::fs;
use std::io;

pub(crate) const ID_PART_TABLE_UUID: &str = "ID_PART_TABLE_UUID";
pub(crate) const ID_PART_ENTRY_UUID: &str = "ID_PART_ENTRY_UUID";
pub(crate) const ID_FS_TYPE: &str = "ID_FS_TYPE";
pub(crate) const ID_FS_LABEL: &str = "ID_FS_LABEL";
pub(crate) const DM_UUID: &str = "DM_UUID";
pub(crate) const DM_NAME: &str = "DM_NAME";
pub(crate) const DM_PART: &str = "DM_PART";

pub(crate) type UdevRecord = HashMap<String, String>;

/// Read the udev record for the sysfs entry `entry` (a disk or partition
/// directory below `sys/block`), resolving its device number from the `dev`
/// file inside the entry.
pub(crate) fn record_for_entry(paths: &Paths, entry: &str) -> io::Result<UdevRecord> {
    let dev_path = paths.sys_block.join(entry).join("dev");
    let dev_no = fs::read_to_string(&dev_path)?;
    record_for_devno(paths, &dev_no)
}

/// Read the udev record for a `major:minor` device number.
pub(crate) fn record_for_devno(paths: &Paths, dev_no: &str) -> io::Result<UdevRecord> {
    let id = format!("b{}", dev_no.trim());
    let db_path = paths.run_udev_data.join(&id);
    trace!("reading udev record {}", db_path.display());
    let contents = fs::read_to_string(&db_path)?;
    Ok(parse_record(&contents))
}

fn parse_record(contents: &str) -> UdevRecord {
    let mut record = UdevRecord::new();
    for line in contents.lines() {
        let Some(rest) = line.strip_prefix("E:") else {
            continue;
        };
        if let Some((key, value)) = rest.split_once('=') {
            record.insert(key.to_string(), value.to_string());
        }
    }
    record
}

/// Fetch a single property, empty-string when the record or key is missing.
pub(crate) fn property(paths: &Paths, entry: &str, key: &str) -> String {
    record_for_entry(paths, entry)
        .ok()
        .and_then(|record| record.get(key).cloned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_record_keeps_only_property_lines() {
        let contents = "S:disk/by-label/DATA\n\
                        E:ID_FS_TYPE=ext4\n\
                        E:ID_FS_LABEL=DATA\n\
                        \n\
                        G:systemd\n\
                        E:ID_PART_ENTRY_UUID=abc-123\n";
        let record = parse_record(contents);
        assert_eq!(record.len(), 3);
        assert_eq!(record.get(ID_FS_TYPE).map(String::as_str), Some("ext4"));
        assert_eq!(record.get(ID_FS_LABEL).map(String::as_str), Some("DATA"));
        assert_eq!(
            record.get(ID_PART_ENTRY_UUID).map(String::as_str),
            Some("abc-123")
        );
    }

    #[test]
    fn parse_record_splits_on_first_equals_only() {
        let record = parse_record("E:DM_UUID=part1-mpath-3600=abc\n");
        assert_eq!(
            record.get(DM_UUID).map(String::as_str),
            Some("part1-mpath-3600=abc")
        );
    }
}
