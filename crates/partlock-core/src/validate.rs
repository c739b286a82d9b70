//! Strategy prerequisite checks.

use crate::{PartlockError, PartlockResult};
use log::{info, warn};
use regex::Regex;
use std::path::Path;
use std::process::Command;

/// Require `systemctl --version` to report at least `min`.
pub(crate) fn validate_systemd_version(min: u32) -> PartlockResult<()> {
    let output = Command::new("systemctl")
        .arg("--version")
        .output()
        .map_err(|err| {
            PartlockError::PrerequisiteMissing(format!("could not get systemd version: {err}"))
        })?;
    if !output.status.success() {
        return Err(PartlockError::PrerequisiteMissing(
            "could not get systemd version: systemctl failed".to_string(),
        ));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let banner = stdout.lines().next().unwrap_or("");
    let version = parse_systemd_version(banner).ok_or_else(|| {
        PartlockError::PrerequisiteMissing(format!(
            "could not extract systemd version from `{banner}`"
        ))
    })?;

    if version < min {
        return Err(PartlockError::PrerequisiteMissing(format!(
            "systemd version is {version}, need {min} or higher for PCR policy encryption"
        )));
    }
    info!("systemd version check passed ({version} >= {min})");
    Ok(())
}

/// First integer in the `systemctl --version` banner, e.g.
/// `systemd 252 (252.5-2ubuntu3)` -> 252.
pub(crate) fn parse_systemd_version(banner: &str) -> Option<u32> {
    Regex::new(r"\d+")
        .expect("static pattern")
        .find(banner)
        .and_then(|digits| digits.as_str().parse().ok())
}

/// Require a TPM 2.0 resource-manager device node. Exposed by the kernel as
/// /dev/tpmrm0 since 4.12.
pub(crate) fn validate_tpm_device(probe: &Path) -> PartlockResult<()> {
    if probe.exists() {
        info!("TPM 2.0 device found at {}", probe.display());
        Ok(())
    } else {
        warn!("could not find TPM 2.0 device at {}", probe.display());
        Err(PartlockError::TpmAbsent(probe.display().to_string()))
    }
}
