//! Mount-table parsing.
//!
//! Mount entries look like `/dev/sda6 / ext4 rw,relatime 0 0`. Mountpoints
//! may contain whitespace encoded as octal escapes per getmntent(3), so the
//! second field is unescaped before use.

use crate::paths::Paths;
use log::trace;
use std::fs;

/// Return `(mountpoint, fstype)` for `device`, empty strings when the device
/// is not present in the mount table or the table cannot be read.
pub(crate) fn mount_info(paths: &Paths, device: &str) -> (String, String) {
    // Accept either `sda1` or `/dev/sda1`.
    let device = if device.starts_with("/dev") {
        device.to_string()
    } else {
        format!("/dev/{device}")
    };

    let contents = match fs::read_to_string(&paths.proc_mounts) {
        Ok(contents) => contents,
        Err(err) => {
            trace!(
                "unable to read mount table {}: {err}",
                paths.proc_mounts.display()
            );
            return (String::new(), String::new());
        }
    };

    for line in contents.lines() {
        if !line.starts_with('/') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(entry_device), Some(mountpoint), Some(fstype)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if entry_device == device {
            return (unescape_mount_field(mountpoint), fstype.to_string());
        }
    }

    (String::new(), String::new())
}

/// Decode the escapes getmntent(3) uses in mountpoint fields: `\NNN` octal
/// byte values (`\040` space, `\011` tab, `\012` newline) and `\\` for a
/// literal backslash.
pub(crate) fn unescape_mount_field(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut pos = 0;

    while pos < bytes.len() {
        if let Some(byte) = octal_escape(&bytes[pos..]) {
            decoded.push(byte);
            pos += 4;
        } else if bytes[pos..].starts_with(b"\\\\") {
            decoded.push(b'\\');
            pos += 2;
        } else {
            decoded.push(bytes[pos]);
            pos += 1;
        }
    }

    String::from_utf8_lossy(&decoded).into_owned()
}

/// The byte value of a `\NNN` escape at the start of `bytes`, when one is
/// present and within the single-byte octal range.
fn octal_escape(bytes: &[u8]) -> Option<u8> {
    match bytes {
        [b'\\', high @ b'0'..=b'3', mid @ b'0'..=b'7', low @ b'0'..=b'7', ..] => {
            Some((high - b'0') * 64 + (mid - b'0') * 8 + (low - b'0'))
        }
        _ => None,
    }
}
