#![forbid(unsafe_code)]

//! LUKS driver for partlock.
//!
//! Thin contract layer over the `cryptsetup`, `mkfs.ext4`,
//! `systemd-cryptenroll` and `dmsetup` binaries plus an in-process unlock
//! path via libcryptsetup. All subprocess invocations log command, exit code
//! and combined output; passphrases only ever appear as lengths.

mod command;
mod system;
mod udev;
mod unlock;

use std::path::PathBuf;

pub use system::{
    create_luks, enroll_pcr_policy, format_luks, tpm_attach, unmount_if_mounted, wait_device,
    wipe_password_slot, TPM_PCR_PUBLIC_KEY, TPM_PCR_SIGNATURE, TPM_SRK_PUBLIC_KEY,
};
pub use udev::{settle, trigger_and_settle, UDEV_SETTLE_TIMEOUT};
pub use unlock::{luks_unlock, CryptsetupOpener, LuksOpener, UnlockProtocol};

/// Errors raised by the LUKS driver.
#[derive(Debug, thiserror::Error)]
pub enum LuksError {
    #[error("cryptsetup luksFormat failed on {device}: {reason}")]
    Format { device: String, reason: String },

    #[error("LUKS unlock failed after {attempts} attempts: {reason}")]
    Unlock { attempts: u32, reason: String },

    #[error("mapper device {0} not created after unlock")]
    MapperNotCreated(PathBuf),

    #[error("mkfs.ext4 failed on {mapper}: {reason}")]
    MkfsFailed { mapper: String, reason: String },

    #[error("cryptsetup refresh failed on {name}: {reason}")]
    RefreshFailed { name: String, reason: String },

    #[error("cryptsetup close failed on {mapper}: {reason}")]
    CloseFailed { mapper: String, reason: String },

    /// The device could not be released before encryption.
    #[error("failed to unmount {device} from {mountpoint}: {reason}")]
    DeviceBusy {
        device: String,
        mountpoint: String,
        reason: String,
    },

    #[error("systemd-cryptenroll failed on {device}: {reason}")]
    EnrollFailed { device: String, reason: String },

    #[error("udev: {0}")]
    Udev(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type LuksResult<T> = Result<T, LuksError>;
