//! Label lookup against a mock sysfs tree with a fake `blkid` on PATH.

use partlock_block::{find_by_label, BlockError, Paths, GHW_CHROOT_ENV};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Mutex;
use tempfile::tempdir;

// Serialises the tests that mutate process environment (PATH, GHW_CHROOT).
static ENV_LOCK: Mutex<()> = Mutex::new(());

struct EnvGuard {
    key: &'static str,
    prev: Option<std::ffi::OsString>,
}

impl EnvGuard {
    fn set(key: &'static str, value: impl Into<std::ffi::OsString>) -> Self {
        let prev = std::env::var_os(key);
        std::env::set_var(key, value.into());
        Self { key, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(value) = self.prev.take() {
            std::env::set_var(self.key, value);
        } else {
            std::env::remove_var(self.key);
        }
    }
}

fn write_executable(path: &Path, contents: &str) {
    fs::write(path, contents).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

fn build_tree(root: &Path) {
    fs::create_dir_all(root.join("sys/block/sda/sda1")).unwrap();
    fs::create_dir_all(root.join("run/udev/data")).unwrap();
    fs::create_dir_all(root.join("proc")).unwrap();

    fs::write(root.join("sys/block/sda/size"), "4096\n").unwrap();
    fs::write(root.join("sys/block/sda/dev"), "8:0\n").unwrap();
    fs::write(root.join("sys/block/sda/sda1/size"), "2048\n").unwrap();
    fs::write(root.join("sys/block/sda/sda1/dev"), "8:1\n").unwrap();

    fs::write(
        root.join("run/udev/data/b8:0"),
        "E:ID_PART_TABLE_UUID=disk-uuid\n",
    )
    .unwrap();
    fs::write(
        root.join("run/udev/data/b8:1"),
        "E:ID_PART_ENTRY_UUID=part-uuid\nE:ID_FS_TYPE=ext4\nE:ID_FS_LABEL=COS_OEM\n",
    )
    .unwrap();
    fs::write(root.join("proc/mounts"), "").unwrap();
}

// Answers only for COS_OEM, so concurrent tests sharing PATH see consistent
// behaviour regardless of which copy of the script wins.
const FAKE_BLKID: &str = "#!/bin/sh\ncase \"$2\" in COS_OEM) echo /dev/sda1 ;; *) exit 2 ;; esac\n";

#[test]
fn finds_partition_by_label_and_keeps_scan_identity() {
    let _env = ENV_LOCK.lock().unwrap();
    let root = tempdir().unwrap();
    build_tree(root.path());

    let bin = tempdir().unwrap();
    write_executable(&bin.path().join("blkid"), FAKE_BLKID);
    let path_var = format!(
        "{}:{}",
        bin.path().display(),
        std::env::var("PATH").unwrap_or_default()
    );
    let _path = EnvGuard::set("PATH", path_var);

    let paths = Paths::new(root.path());
    let part = find_by_label(&paths, "COS_OEM").unwrap();
    assert_eq!(part.name, "sda1");
    assert_eq!(part.path, "/dev/sda1");
    assert_eq!(part.uuid, "part-uuid");
    assert_eq!(part.filesystem_label, "COS_OEM");
}

#[test]
fn missing_label_is_an_error() {
    let _env = ENV_LOCK.lock().unwrap();
    let root = tempdir().unwrap();
    build_tree(root.path());

    let bin = tempdir().unwrap();
    write_executable(&bin.path().join("blkid"), FAKE_BLKID);
    let path_var = format!(
        "{}:{}",
        bin.path().display(),
        std::env::var("PATH").unwrap_or_default()
    );
    let _path = EnvGuard::set("PATH", path_var);

    let paths = Paths::new(root.path());
    let err = find_by_label(&paths, "NO_SUCH_LABEL").unwrap_err();
    assert!(matches!(err, BlockError::PartitionNotFound(label) if label == "NO_SUCH_LABEL"));
}

#[test]
fn chroot_env_overrides_programmatic_root() {
    let _env = ENV_LOCK.lock().unwrap();
    let root = tempdir().unwrap();
    build_tree(root.path());

    let _chroot = EnvGuard::set(GHW_CHROOT_ENV, root.path());
    let paths = Paths::detect(Some(Path::new("/nonexistent")));
    assert_eq!(paths.sys_block, root.path().join("sys/block"));

    let disks = partlock_block::disks(&paths).unwrap();
    assert_eq!(disks.len(), 1);
    assert_eq!(disks[0].partitions[0].filesystem_label, "COS_OEM");
}
