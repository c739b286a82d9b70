#![forbid(unsafe_code)]

//! Block-device discovery for partlock.
//!
//! Scans a (chrootable) `/sys/block` tree, resolves partition metadata from
//! the udev runtime database and the mount table, and looks partitions up by
//! filesystem label. Multipath parents and their `dm-*` partitions are
//! classified from udev attributes so partitions never surface as disks.

mod label;
mod mounts;
mod paths;
mod scan;
mod types;
mod udevdb;

use std::io;
use std::path::PathBuf;

pub use label::{blkid_path, find_by_label};
pub use paths::{Paths, GHW_CHROOT_ENV};
pub use scan::disks;
pub use types::{Disk, Partition};

/// Errors surfaced by block-device discovery.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    /// The sys-block tree itself could not be enumerated.
    #[error("failed to scan block devices under {path}: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// No partition carries the requested filesystem label.
    #[error("no partition with filesystem label `{0}`")]
    PartitionNotFound(String),
}

/// Result alias used throughout the crate.
pub type BlockResult<T> = Result<T, BlockError>;
