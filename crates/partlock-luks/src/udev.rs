//! udev settling against a racing block layer.

use crate::command::Cmd;
use crate::{LuksError, LuksResult};
use std::time::Duration;

/// Default settle budget for top-level operations.
pub const UDEV_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait until the udev event queue for block devices is drained.
pub fn settle(timeout: Duration) -> LuksResult<()> {
    let result = Cmd::new("udevadm")
        .arg("settle")
        .arg(format!("--timeout={}", timeout.as_secs()))
        .run()
        .map_err(|err| LuksError::Udev(format!("udevadm settle: {err}")))?;
    if !result.success {
        return Err(LuksError::Udev(format!(
            "udevadm settle failed: {}",
            result.output.trim()
        )));
    }
    Ok(())
}

/// Re-probe all devices, flush dirty pages, and settle.
///
/// Older udevadm has no `--type=all`; fall back to a plain trigger.
pub fn trigger_and_settle(timeout: Duration) -> LuksResult<()> {
    let trigger = Cmd::new("udevadm")
        .args(["trigger", "--type=all"])
        .run()
        .map_err(|err| LuksError::Udev(format!("udevadm trigger: {err}")))?;
    if !trigger.success {
        let fallback = Cmd::new("udevadm")
            .arg("trigger")
            .run()
            .map_err(|err| LuksError::Udev(format!("udevadm trigger: {err}")))?;
        if !fallback.success {
            return Err(LuksError::Udev(format!(
                "udevadm trigger failed: {}",
                fallback.output.trim()
            )));
        }
    }

    nix::unistd::sync();
    settle(timeout)
}
