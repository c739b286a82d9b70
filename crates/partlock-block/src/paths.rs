//! Filesystem locations consumed by the resolver.
//!
//! Everything is derived from a single root so tests (and installers working
//! inside a chroot) can point the whole crate at a mock tree.

use std::env;
use std::path::{Path, PathBuf};

/// Environment variable overriding the resolver root. Takes precedence over
/// any root passed programmatically.
pub const GHW_CHROOT_ENV: &str = "GHW_CHROOT";

/// Resolved locations of the three kernel interfaces the resolver reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    pub sys_block: PathBuf,
    pub run_udev_data: PathBuf,
    pub proc_mounts: PathBuf,
}

impl Paths {
    /// Compose the standard locations below `root`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            sys_block: root.join("sys/block"),
            run_udev_data: root.join("run/udev/data"),
            proc_mounts: root.join("proc/mounts"),
        }
    }

    /// Resolve locations from `GHW_CHROOT` when set, then from the optional
    /// prefix, then from `/`.
    pub fn detect(prefix: Option<&Path>) -> Self {
        if let Some(root) = env::var_os(GHW_CHROOT_ENV) {
            return Self::new(PathBuf::from(root));
        }
        match prefix {
            Some(root) => Self::new(root),
            None => Self::new("/"),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::detect(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_composes_standard_locations() {
        let paths = Paths::new("/mock");
        assert_eq!(paths.sys_block, PathBuf::from("/mock/sys/block"));
        assert_eq!(paths.run_udev_data, PathBuf::from("/mock/run/udev/data"));
        assert_eq!(paths.proc_mounts, PathBuf::from("/mock/proc/mounts"));
    }

    #[test]
    fn detect_prefers_explicit_prefix_without_env() {
        // GHW_CHROOT is exercised in the integration tests to avoid racing
        // other unit tests on process environment.
        let paths = Paths::detect(Some(Path::new("/chroot")));
        assert_eq!(paths.sys_block, PathBuf::from("/chroot/sys/block"));
    }
}
