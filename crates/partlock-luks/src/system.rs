//! Operations over the host's LUKS tooling.

use crate::command::Cmd;
use crate::udev::settle;
use crate::{LuksError, LuksResult};
use log::{debug, info};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

/// PCR public key extracted from the UKI `.pcrpkey` section by systemd.
pub const TPM_PCR_PUBLIC_KEY: &str = "/run/systemd/tpm2-pcr-public-key.pem";
/// PCR signature extracted from the UKI `.pcrsig` section by systemd.
pub const TPM_PCR_SIGNATURE: &str = "/run/systemd/tpm2-pcr-signature.json";
/// SRK public key exported by systemd at boot.
pub const TPM_SRK_PUBLIC_KEY: &str = "/run/systemd/tpm2-srk-public-key.tpm2b_public";

const INTRA_RETRY_SETTLE: Duration = Duration::from_secs(10);

/// Create a LUKS2 container on `device`, feeding the passphrase on stdin.
/// THIS OVERWRITES DATA on the device.
pub fn create_luks(device: &str, passphrase: &str, extra_args: &[String]) -> LuksResult<()> {
    info!("creating LUKS2 container on {device}");
    let result = Cmd::new("cryptsetup")
        .args(["luksFormat", "--type", "luks2", "--iter-time", "5", "-q"])
        .arg(device)
        .args(extra_args.iter().cloned())
        .stdin_secret(passphrase)
        .run()?;
    if !result.success {
        return Err(LuksError::Format {
            device: device.to_string(),
            reason: result.output.trim().to_string(),
        });
    }
    Ok(())
}

/// Unlock `device`, wait for the mapper node, create the inner ext4
/// filesystem, persist discard support, and close the container again.
pub fn format_luks(
    device: &str,
    name: &str,
    mapper: &str,
    label: &str,
    passphrase: &str,
) -> LuksResult<()> {
    debug!("unlocking {device} as {name} for formatting");
    crate::unlock::luks_unlock(device, name, passphrase)?;

    debug!("waiting for mapper {mapper}");
    wait_device(Path::new(mapper), 10)?;

    debug!("formatting {mapper}");
    let mkfs = Cmd::new("mkfs.ext4").args(["-L", label, mapper]).run()?;
    if !mkfs.success {
        return Err(LuksError::MkfsFailed {
            mapper: mapper.to_string(),
            reason: mkfs.output.trim().to_string(),
        });
    }

    // Refresh acts on the active device and needs the passphrase again.
    // cryptsetup v2.8+ expects the device name here, not the node path.
    debug!("persisting discards on {name}");
    let refresh = Cmd::new("cryptsetup")
        .args(["refresh", "--persistent", "--allow-discards", name])
        .stdin_secret(passphrase)
        .run()?;
    if !refresh.success {
        return Err(LuksError::RefreshFailed {
            name: name.to_string(),
            reason: refresh.output.trim().to_string(),
        });
    }

    debug!("closing {mapper}");
    let close = Cmd::new("cryptsetup").args(["close", mapper]).run()?;
    if !close.success {
        return Err(LuksError::CloseFailed {
            mapper: mapper.to_string(),
            reason: close.output.trim().to_string(),
        });
    }

    Ok(())
}

/// Enroll a TPM2 PCR policy as a keyslot on `device`.
///
/// The current boot's signature is passed along so enrollment fails early
/// when a UKI with these measurements could not unlock the device. The
/// artifacts are exported by systemd from the UKI binary itself. When
/// `public_pcrs` is empty PCR 11 (the UKI measurement) is used; `bound_pcrs`
/// stays empty unless the caller binds specific registers.
pub fn enroll_pcr_policy(
    device: &str,
    passphrase: &str,
    public_pcrs: &[String],
    bound_pcrs: &[String],
) -> LuksResult<()> {
    let default_public_pcrs = ["11".to_string()];
    let public_pcrs = if public_pcrs.is_empty() {
        &default_public_pcrs[..]
    } else {
        public_pcrs
    };

    let result = Cmd::new("systemd-cryptenroll")
        .arg(format!("--tpm2-public-key={TPM_PCR_PUBLIC_KEY}"))
        .arg(format!("--tpm2-public-key-pcrs={}", public_pcrs.join("+")))
        .arg(format!("--tpm2-pcrs={}", bound_pcrs.join("+")))
        .arg(format!("--tpm2-signature={TPM_PCR_SIGNATURE}"))
        .arg(format!("--tpm2-device-key={TPM_SRK_PUBLIC_KEY}"))
        .arg(device)
        // cryptenroll cannot take the passphrase on stdin.
        .secret_env("PASSWORD", passphrase)
        .env("SYSTEMD_LOG_LEVEL", "debug")
        .run()?;

    if !result.success {
        return Err(LuksError::EnrollFailed {
            device: device.to_string(),
            reason: result.output.trim().to_string(),
        });
    }
    Ok(())
}

/// Attach `device` as `name` using the TPM2 policy keyslot.
///
/// systemd-cryptsetup is not on PATH on most distributions, hence the
/// absolute location. Debug logging is forced in the child: policy failures
/// are otherwise near-impossible to diagnose on a headless boot.
pub fn tpm_attach(name: &str, device: &str) -> LuksResult<()> {
    let result = Cmd::new("/usr/lib/systemd/systemd-cryptsetup")
        .args(["attach", name, device, "-", "tpm2-device=auto"])
        .env("SYSTEMD_LOG_LEVEL", "debug")
        .run()?;
    if !result.success {
        return Err(LuksError::Unlock {
            attempts: 1,
            reason: format!("TPM unlock failed (output: {})", result.output.trim()),
        });
    }
    Ok(())
}

/// Drop the passphrase keyslot, leaving only the TPM policy.
pub fn wipe_password_slot(device: &str) -> LuksResult<()> {
    let result = Cmd::new("systemd-cryptenroll")
        .arg("--wipe-slot=password")
        .arg(device)
        .run()?;
    if !result.success {
        return Err(LuksError::EnrollFailed {
            device: device.to_string(),
            reason: format!("wipe-slot failed: {}", result.output.trim()),
        });
    }
    Ok(())
}

/// Unmount `device` when the mount table lists it; cryptsetup cannot format
/// a mounted partition.
pub fn unmount_if_mounted(device: &str) -> LuksResult<()> {
    unmount_if_mounted_at(device, Path::new("/proc/mounts"))
}

fn unmount_if_mounted_at(device: &str, mount_table: &Path) -> LuksResult<()> {
    let contents = fs::read_to_string(mount_table)?;
    let Some(mountpoint) = lookup_mountpoint(&contents, device) else {
        return Ok(());
    };

    debug!("{device} is mounted at {mountpoint}, unmounting before encryption");
    nix::mount::umount(mountpoint.as_str()).map_err(|err| LuksError::DeviceBusy {
        device: device.to_string(),
        mountpoint: mountpoint.clone(),
        reason: err.to_string(),
    })?;
    debug!("unmounted {device}");
    Ok(())
}

fn lookup_mountpoint(mount_table: &str, device: &str) -> Option<String> {
    for line in mount_table.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some(device) {
            return fields.next().map(str::to_string);
        }
    }
    None
}

/// Poll for a device node to appear, settling udev between attempts.
pub fn wait_device(device: &Path, attempts: u32) -> LuksResult<()> {
    for tries in 0..attempts {
        settle(INTRA_RETRY_SETTLE)?;
        nix::unistd::sync();
        if device.symlink_metadata().is_ok() {
            return Ok(());
        }
        if tries + 1 < attempts {
            thread::sleep(Duration::from_secs(1));
        }
    }
    Err(LuksError::MapperNotCreated(device.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_mountpoint_matches_first_field_exactly() {
        let table = "/dev/sda1 /efi vfat rw 0 0\n/dev/sda6 / ext4 rw 0 0\n";
        assert_eq!(lookup_mountpoint(table, "/dev/sda6"), Some("/".to_string()));
        assert_eq!(lookup_mountpoint(table, "/dev/sda"), None);
    }

    #[test]
    fn unmount_is_a_noop_for_unmounted_devices() {
        let dir = tempfile::tempdir().unwrap();
        let table = dir.path().join("mounts");
        fs::write(&table, "/dev/sda1 /efi vfat rw 0 0\n").unwrap();
        unmount_if_mounted_at("/dev/sdz9", &table).unwrap();
    }
}
