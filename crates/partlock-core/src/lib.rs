//! Partition encryption orchestrator.
//!
//! Decides how each labeled disk partition should be encrypted or unlocked
//! at boot, then drives the chosen mechanism end-to-end: a remote KMS
//! reached through the discovery bus, a TPM PCR policy for UKI boots, or a
//! passphrase sealed in TPM NV memory. Invoked once per install (encrypt)
//! or once per boot (unlock) by a host agent; there is no daemon here.

pub mod config;
mod driver;
mod encryptor;
mod error;
pub mod logging;
mod selector;
mod validate;

pub use config::{
    extract_kcrypt_config, extract_pcr_bindings, scan_kcrypt_config, scan_merged_config,
    KcryptConfig, PcrBindings, DEFAULT_CONFIG_DIRS,
};
pub use driver::{encrypt_partitions, unlock_all, unlock_all_with};
pub use encryptor::{
    EncryptionStrategy, Encryptor, LocalNvEncryptor, RemoteKmsEncryptor, TpmPcrEncryptor,
};
pub use error::{PartlockError, PartlockResult};
pub use selector::{detect_uki_mode, detect_uki_mode_at, get_encryptor, Selector};
