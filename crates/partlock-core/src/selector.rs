//! Strategy selection.
//!
//! One merged configuration scan plus the UKI probe decide everything:
//!
//! 1. challenger server configured or mDNS enabled -> remote KMS;
//! 2. else UKI boot -> TPM with PCR policy, carrying the configured
//!    PCR-binding lists;
//! 3. else -> local TPM NV passphrase.

use crate::config::{
    extract_kcrypt_config, extract_pcr_bindings, scan_merged_config, KcryptConfig, PcrBindings,
};
use crate::encryptor::{
    EncryptionStrategy, Encryptor, LocalNvEncryptor, RemoteKmsEncryptor, TpmPcrEncryptor,
};
use crate::PartlockResult;
use log::{debug, info};
use std::path::Path;

/// Chooses an encryption strategy from system state and configuration.
pub struct Selector;

impl Selector {
    /// Pure decision from already-gathered inputs. Deterministic; never
    /// mutates its arguments.
    pub fn choose(config: Option<&KcryptConfig>, uki_mode: bool, bindings: PcrBindings) -> Encryptor {
        if let Some(config) = config.filter(|config| config.wants_remote()) {
            info!(
                "using remote KMS (challenger_server `{}`, mdns {})",
                config.challenger_server, config.mdns
            );
            return Encryptor::RemoteKms(RemoteKmsEncryptor::new(Some(config.clone())));
        }
        if uki_mode {
            info!("using TPM with PCR policy (UKI boot)");
            return Encryptor::TpmPcr(TpmPcrEncryptor::new(bindings));
        }
        info!("using local TPM NV passphrase");
        Encryptor::LocalNv(LocalNvEncryptor::new(config.cloned()))
    }
}

/// Scan configuration once, detect UKI mode, build the strategy, and check
/// its prerequisites.
pub fn get_encryptor() -> PartlockResult<Encryptor> {
    let merged = scan_merged_config(None);
    let config = merged
        .as_ref()
        .and_then(|merged| extract_kcrypt_config(&merged.values));
    let uki_mode = detect_uki_mode();

    // PCR bindings only matter in UKI mode, and they come from the same
    // merged tree as the kcrypt config.
    let bindings = if uki_mode {
        merged
            .as_ref()
            .map(|merged| extract_pcr_bindings(&merged.values))
            .unwrap_or_default()
    } else {
        PcrBindings::default()
    };

    let encryptor = Selector::choose(config.as_ref(), uki_mode, bindings);
    info!("selected strategy: {}", encryptor.name());
    encryptor.validate()?;
    Ok(encryptor)
}

/// Whether this boot came from a unified kernel image.
pub fn detect_uki_mode() -> bool {
    detect_uki_mode_at(Path::new("/"))
}

/// UKI probe with an explicit root. systemd exports the PCR signature and
/// public key from the UKI sections at boot; their presence is the reliable
/// marker, the cmdline itself carries no stable token.
pub fn detect_uki_mode_at(root: &Path) -> bool {
    for marker in [
        "run/systemd/tpm2-pcr-signature.json",
        "run/systemd/tpm2-pcr-public-key.pem",
    ] {
        if root.join(marker).exists() {
            debug!("detected UKI mode: found {marker}");
            return true;
        }
    }
    debug!("not running in UKI mode");
    false
}
