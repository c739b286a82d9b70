//! Retry/verify behaviour of the unlock protocol against a scripted opener
//! and fake `udevadm`/`dmsetup` binaries.

use partlock_luks::{LuksError, LuksOpener, UnlockProtocol};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

// Serialises the tests that prepend fake tools to PATH.
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

/// Fake udevadm (counting settles into a file) and a dmsetup that always
/// reports the crypt target.
fn fake_tools(bin: &Path, settle_log: &Path, mapper_name: &str) -> EnvGuard {
    write_executable(
        &bin.join("udevadm"),
        &format!("#!/bin/sh\necho settle >> {}\nexit 0\n", settle_log.display()),
    );
    write_executable(
        &bin.join("dmsetup"),
        &format!("#!/bin/sh\necho '{mapper_name}\t(253:0)'\nexit 0\n"),
    );
    let path_var = format!(
        "{}:{}",
        bin.display(),
        std::env::var("PATH").unwrap_or_default()
    );
    EnvGuard::set("PATH", path_var)
}

/// Fails a fixed number of times, then succeeds and materialises the mapper
/// node.
struct FlakyOpener {
    failures: u32,
    calls: AtomicU32,
    mapper_path: Mutex<PathBuf>,
}

impl FlakyOpener {
    fn new(failures: u32, mapper_path: PathBuf) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
            mapper_path: Mutex::new(mapper_path),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl LuksOpener for &FlakyOpener {
    fn open_and_activate(&self, _device: &Path, _name: &str, _passphrase: &str)
        -> Result<(), String> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err("keyslot timing".to_string());
        }
        fs::write(&*self.mapper_path.lock().unwrap(), "").unwrap();
        Ok(())
    }
}

#[test]
fn unlock_recovers_after_two_failures_with_intermediate_settles() {
    let _env = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    let mapper_dir = dir.path().join("mapper");
    fs::create_dir_all(&bin).unwrap();
    fs::create_dir_all(&mapper_dir).unwrap();

    let settle_log = dir.path().join("settles");
    let _path = fake_tools(&bin, &settle_log, "vault");

    let device = dir.path().join("device");
    fs::write(&device, "").unwrap();

    let opener = FlakyOpener::new(2, mapper_dir.join("vault"));
    let protocol = UnlockProtocol::new(&opener).with_mapper_dir(&mapper_dir);
    protocol
        .unlock(device.to_str().unwrap(), "vault", "hunter2")
        .unwrap();

    assert_eq!(opener.calls(), 3, "fails twice, succeeds on attempt 3");
    let settles = fs::read_to_string(&settle_log).unwrap();
    // Two settles between the retries plus the post-unlock settle.
    assert!(settles.lines().count() >= 3, "settles: {settles:?}");
}

#[test]
fn unlock_is_idempotent_when_mapper_exists() {
    let dir = tempfile::tempdir().unwrap();
    let mapper_dir = dir.path().join("mapper");
    fs::create_dir_all(&mapper_dir).unwrap();
    fs::write(mapper_dir.join("vault"), "").unwrap();

    let device = dir.path().join("device");
    fs::write(&device, "").unwrap();

    // No fake tools on PATH: any subprocess or opener call would fail.
    let opener = FlakyOpener::new(u32::MAX, mapper_dir.join("vault"));
    let protocol = UnlockProtocol::new(&opener).with_mapper_dir(&mapper_dir);
    protocol
        .unlock(device.to_str().unwrap(), "vault", "hunter2")
        .unwrap();
    assert_eq!(opener.calls(), 0);
}

#[test]
fn unlock_exhausts_after_three_attempts() {
    let _env = ENV_LOCK.lock().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let bin = dir.path().join("bin");
    let mapper_dir = dir.path().join("mapper");
    fs::create_dir_all(&bin).unwrap();
    fs::create_dir_all(&mapper_dir).unwrap();
    let settle_log = dir.path().join("settles");
    let _path = fake_tools(&bin, &settle_log, "vault");

    let device = dir.path().join("device");
    fs::write(&device, "").unwrap();

    let opener = FlakyOpener::new(u32::MAX, mapper_dir.join("vault"));
    let protocol = UnlockProtocol::new(&opener).with_mapper_dir(&mapper_dir);
    let err = protocol
        .unlock(device.to_str().unwrap(), "vault", "hunter2")
        .unwrap_err();

    assert_eq!(opener.calls(), 3);
    assert!(matches!(err, LuksError::Unlock { attempts: 3, .. }));
}

#[test]
fn missing_device_fails_before_any_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let opener = FlakyOpener::new(0, dir.path().join("unused"));
    let protocol = UnlockProtocol::new(&opener).with_mapper_dir(dir.path());
    let err = protocol.unlock("/no/such/device", "vault", "pw").unwrap_err();
    assert!(matches!(err, LuksError::Unlock { attempts: 0, .. }));
    assert_eq!(opener.calls(), 0);
}
