//! The unlock protocol.
//!
//! Opening a LUKS container races the block layer: the header may not be
//! visible yet, and after activation the mapper node takes a moment to
//! appear. The protocol below pins the observable ordering with bounded
//! retries, udev settles and a device-mapper poll instead of trusting any
//! single event.

use crate::command::Cmd;
use crate::udev::settle;
use crate::{LuksError, LuksResult};
use libcryptsetup_rs::consts::flags::CryptActivate;
use libcryptsetup_rs::consts::vals::EncryptionFormat;
use libcryptsetup_rs::CryptInit;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

const OPEN_RETRIES: u32 = 3;
const DM_POLL_ATTEMPTS: u32 = 5;
const POST_UNLOCK_SETTLE: Duration = Duration::from_secs(30);
const RETRY_SETTLE: Duration = Duration::from_secs(10);

/// Opens a LUKS header and activates a keyslot. Abstracted so the retry
/// protocol can be exercised without a real container.
pub trait LuksOpener {
    /// Open `device`, unlock slot 0 with `passphrase` under `name`, and
    /// release the handle.
    fn open_and_activate(&self, device: &Path, name: &str, passphrase: &str)
        -> Result<(), String>;
}

/// Production opener backed by libcryptsetup.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptsetupOpener;

impl LuksOpener for CryptsetupOpener {
    fn open_and_activate(
        &self,
        device: &Path,
        name: &str,
        passphrase: &str,
    ) -> Result<(), String> {
        let mut crypt_device =
            CryptInit::init(device).map_err(|err| format!("acquiring context: {err}"))?;
        crypt_device
            .context_handle()
            .load::<()>(Some(EncryptionFormat::Luks2), None)
            .map_err(|err| format!("loading LUKS2 header: {err}"))?;
        crypt_device
            .activate_handle()
            .activate_by_passphrase(Some(name), Some(0), passphrase.as_bytes(), CryptActivate::empty())
            .map_err(|err| format!("activating keyslot 0: {err}"))?;
        // Handle drops here, releasing the file descriptor immediately.
        Ok(())
    }
}

/// Retry/verify driver around a [`LuksOpener`].
pub struct UnlockProtocol<O: LuksOpener> {
    opener: O,
    mapper_dir: PathBuf,
}

impl<O: LuksOpener> UnlockProtocol<O> {
    pub fn new(opener: O) -> Self {
        Self {
            opener,
            mapper_dir: PathBuf::from("/dev/mapper"),
        }
    }

    /// Override the mapper directory (tests).
    pub fn with_mapper_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.mapper_dir = dir.into();
        self
    }

    /// Unlock `device` as `/dev/mapper/<name>`.
    ///
    /// Already-active mappings return success without touching the opener.
    /// Otherwise: up to 3 open attempts spaced 0/1/2 seconds with a settle in
    /// between, a long settle after success, then a `dmsetup` poll until the
    /// crypt target lists the mapping. Failure to observe the mapper node at
    /// the end is an error even when activation claimed success.
    pub fn unlock(&self, device: &str, name: &str, passphrase: &str) -> LuksResult<()> {
        let device_path = Path::new(device);
        if !device_path.exists() {
            return Err(LuksError::Unlock {
                attempts: 0,
                reason: format!("device {device} not accessible"),
            });
        }

        let mapper_path = self.mapper_dir.join(name);
        if mapper_path.exists() {
            debug!("mapper {} already exists", mapper_path.display());
            return Ok(());
        }

        let mut last_err = String::new();
        let mut unlocked = false;
        for attempt in 0..OPEN_RETRIES {
            if attempt > 0 {
                thread::sleep(Duration::from_secs(u64::from(attempt)));
                if let Err(err) = settle(RETRY_SETTLE) {
                    warn!("settle between unlock attempts: {err}");
                }
            }
            match self.opener.open_and_activate(device_path, name, passphrase) {
                Ok(()) => {
                    debug!("unlocked {device} on attempt {}", attempt + 1);
                    unlocked = true;
                    break;
                }
                Err(err) => {
                    warn!(
                        "unlock attempt {}/{OPEN_RETRIES} for {device} failed: {err}",
                        attempt + 1
                    );
                    last_err = err;
                }
            }
        }
        if !unlocked {
            return Err(LuksError::Unlock {
                attempts: OPEN_RETRIES,
                reason: last_err,
            });
        }

        if let Err(err) = settle(POST_UNLOCK_SETTLE) {
            warn!("settle after unlock: {err}");
        }

        // The node can exist before device-mapper has registered the crypt
        // target; poll dmsetup so later steps see a consistent view.
        for _ in 0..DM_POLL_ATTEMPTS {
            if crypt_targets().is_ok_and(|listing| listing.contains(name)) {
                break;
            }
            thread::sleep(Duration::from_secs(1));
        }

        if !mapper_path.exists() {
            return Err(LuksError::MapperNotCreated(mapper_path));
        }
        Ok(())
    }
}

/// Unlock with the production opener and `/dev/mapper`.
pub fn luks_unlock(device: &str, name: &str, passphrase: &str) -> LuksResult<()> {
    UnlockProtocol::new(CryptsetupOpener).unlock(device, name, passphrase)
}

fn crypt_targets() -> LuksResult<String> {
    let result = Cmd::new("dmsetup").args(["ls", "--target", "crypt"]).run()?;
    Ok(result.output)
}
