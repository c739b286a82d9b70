#![forbid(unsafe_code)]

//! TPM-backed passphrase storage.
//!
//! A passphrase lives sealed in a TPM NV index; an optional second index
//! ("sealing index") supplies the auth secret protecting the sealed object.
//! The wire-level TPM work is delegated to a [`SealedBlobStore`], with the
//! production implementation shelling out to the host tpm2-tools.

mod command;
mod tools;

use log::debug;
use rand::distributions::Alphanumeric;
use rand::Rng;
use zeroize::Zeroizing;

pub use tools::TpmTools;

/// NV index used for the local passphrase when none is configured.
pub const DEFAULT_NV_INDEX: &str = "0x1500000";

/// Kernel resource-manager device exposing TPM 2.0 to userspace.
pub const TPM_RESOURCE_DEVICE: &str = "/dev/tpmrm0";

const PASSPHRASE_LENGTH: usize = 32;

/// Errors from TPM blob operations.
#[derive(Debug, thiserror::Error)]
pub enum TpmError {
    #[error("reading NV index {index}: {reason}")]
    Read { index: String, reason: String },

    #[error("sealing blob: {0}")]
    Seal(String),

    #[error("unsealing blob: {0}")]
    Unseal(String),

    #[error("writing NV index {index}: {reason}")]
    Write { index: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type TpmResult<T> = Result<T, TpmError>;

/// Target selection for a blob operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TpmOpts {
    /// NV index holding the blob.
    pub nv_index: Option<String>,
    /// NV index whose value protects the sealed object.
    pub auth_index: Option<String>,
    /// TPM device path; the kernel default when unset.
    pub device: Option<String>,
}

/// Sealed-blob operations against a TPM.
pub trait SealedBlobStore {
    /// Read the raw blob stored at the NV index.
    fn read_blob(&self, opts: &TpmOpts) -> TpmResult<Vec<u8>>;

    /// Store a raw blob at the NV index, replacing any previous contents.
    fn store_blob(&self, blob: &[u8], opts: &TpmOpts) -> TpmResult<()>;

    /// Seal cleartext into a blob only this TPM can open.
    fn encrypt_blob(&self, data: &[u8], opts: &TpmOpts) -> TpmResult<Vec<u8>>;

    /// Unseal a blob produced by [`SealedBlobStore::encrypt_blob`].
    fn decrypt_blob(&self, blob: &[u8], opts: &TpmOpts) -> TpmResult<Vec<u8>>;
}

/// Fetch the local passphrase, creating and persisting it on first use.
///
/// Empty `nv_index` falls back to [`DEFAULT_NV_INDEX`]; empty `c_index` and
/// `tpm_device` mean "unset". A read failure is taken as "not provisioned
/// yet" and triggers generation, sealing and storage of a fresh passphrase.
pub fn get_or_create_passphrase(
    store: &dyn SealedBlobStore,
    nv_index: &str,
    c_index: &str,
    tpm_device: &str,
) -> TpmResult<Zeroizing<String>> {
    let nv_index = if nv_index.is_empty() {
        DEFAULT_NV_INDEX
    } else {
        nv_index
    };
    let device = non_empty(tpm_device);
    let auth_index = non_empty(c_index);

    let read_opts = TpmOpts {
        nv_index: Some(nv_index.to_string()),
        auth_index: None,
        device: device.clone(),
    };

    let sealed = match store.read_blob(&read_opts) {
        Ok(sealed) => sealed,
        Err(err) => {
            debug!("no passphrase blob at {nv_index} ({err}), provisioning one");
            return generate_and_store(store, nv_index, auth_index, device);
        }
    };

    let seal_opts = TpmOpts {
        nv_index: None,
        auth_index,
        device,
    };
    let cleartext = store.decrypt_blob(&sealed, &seal_opts)?;
    String::from_utf8(cleartext)
        .map(Zeroizing::new)
        .map_err(|_| TpmError::Unseal("unsealed passphrase is not UTF-8".to_string()))
}

fn generate_and_store(
    store: &dyn SealedBlobStore,
    nv_index: &str,
    auth_index: Option<String>,
    device: Option<String>,
) -> TpmResult<Zeroizing<String>> {
    let passphrase = random_passphrase(PASSPHRASE_LENGTH);

    let seal_opts = TpmOpts {
        nv_index: None,
        auth_index,
        device: device.clone(),
    };
    let blob = store.encrypt_blob(passphrase.as_bytes(), &seal_opts)?;

    let write_opts = TpmOpts {
        nv_index: Some(nv_index.to_string()),
        auth_index: None,
        device,
    };
    store.store_blob(&blob, &write_opts)?;
    Ok(passphrase)
}

/// Random alphanumeric passphrase.
pub fn random_passphrase(length: usize) -> Zeroizing<String> {
    Zeroizing::new(
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect(),
    )
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
