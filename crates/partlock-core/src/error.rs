//! Error taxonomy of the orchestrator.
//!
//! Collaborator crates keep their own small error enums; everything funnels
//! into [`PartlockError`] at the strategy boundary so callers see one
//! semantic vocabulary.

use partlock_block::BlockError;
use partlock_bus::BusError;
use partlock_collector::CollectorError;
use partlock_luks::LuksError;
use partlock_tpm::TpmError;

#[derive(Debug, thiserror::Error)]
pub enum PartlockError {
    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("configuration merge: {0}")]
    ConfigMerge(String),

    #[error("no partition with filesystem label `{0}`")]
    PartitionNotFound(String),

    #[error("block device scan failed: {0}")]
    BlockScanFailed(String),

    /// The target device could not be released before encryption.
    #[error("device busy: {0}")]
    DeviceBusy(String),

    #[error("LUKS format failed: {0}")]
    LuksFormatFailed(String),

    #[error("LUKS unlock failed: {0}")]
    LuksUnlockFailed(String),

    #[error("mapper device {0} not created after unlock")]
    MapperNotCreated(String),

    #[error("filesystem format failed: {0}")]
    FormatFilesystemFailed(String),

    #[error("cryptsetup refresh failed: {0}")]
    CryptsetupRefreshFailed(String),

    #[error("cryptsetup close failed: {0}")]
    CryptsetupCloseFailed(String),

    #[error("PCR policy enrollment failed: {0}")]
    PcrEnrollFailed(String),

    #[error("could not find TPM 2.0 device at {0}")]
    TpmAbsent(String),

    #[error("TPM read failed: {0}")]
    TpmReadFailed(String),

    #[error("TPM seal failed: {0}")]
    TpmSealFailed(String),

    #[error("TPM unseal failed: {0}")]
    TpmUnsealFailed(String),

    #[error("TPM write failed: {0}")]
    TpmWriteFailed(String),

    /// A discovery plugin answered with an error payload.
    #[error("discovery plugin: {0}")]
    PluginError(String),

    /// A discovery plugin answered success with no data.
    #[error("received empty password from discovery plugin")]
    EmptyPassword,

    /// A strategy prerequisite (systemd version, TPM device) is not met.
    #[error("prerequisite missing: {0}")]
    PrerequisiteMissing(String),

    /// The per-label retry budget ran out; carries the last failure.
    #[error("failed to unlock `{label}` after {attempts} attempts")]
    UnlockExhausted {
        label: String,
        attempts: u32,
        #[source]
        source: Box<PartlockError>,
    },

    #[error("udev: {0}")]
    Udev(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type PartlockResult<T> = Result<T, PartlockError>;

impl From<BlockError> for PartlockError {
    fn from(err: BlockError) -> Self {
        match err {
            BlockError::PartitionNotFound(label) => PartlockError::PartitionNotFound(label),
            scan @ BlockError::Scan { .. } => PartlockError::BlockScanFailed(scan.to_string()),
        }
    }
}

impl From<CollectorError> for PartlockError {
    fn from(err: CollectorError) -> Self {
        match err {
            CollectorError::Parse(parse) => PartlockError::ConfigParse(parse.to_string()),
            merge @ CollectorError::MergeKind { .. } => {
                PartlockError::ConfigMerge(merge.to_string())
            }
            CollectorError::Io(io) => PartlockError::Io(io),
        }
    }
}

impl From<BusError> for PartlockError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Plugin(reason) => PartlockError::PluginError(reason),
            BusError::NoResponse(_) => PartlockError::EmptyPassword,
            other => PartlockError::PluginError(other.to_string()),
        }
    }
}

impl From<LuksError> for PartlockError {
    fn from(err: LuksError) -> Self {
        match err {
            LuksError::Format { .. } => PartlockError::LuksFormatFailed(err.to_string()),
            LuksError::Unlock { .. } => PartlockError::LuksUnlockFailed(err.to_string()),
            LuksError::MapperNotCreated(path) => {
                PartlockError::MapperNotCreated(path.display().to_string())
            }
            LuksError::MkfsFailed { .. } => PartlockError::FormatFilesystemFailed(err.to_string()),
            LuksError::RefreshFailed { .. } => {
                PartlockError::CryptsetupRefreshFailed(err.to_string())
            }
            LuksError::CloseFailed { .. } => PartlockError::CryptsetupCloseFailed(err.to_string()),
            LuksError::DeviceBusy { .. } => PartlockError::DeviceBusy(err.to_string()),
            LuksError::EnrollFailed { .. } => PartlockError::PcrEnrollFailed(err.to_string()),
            LuksError::Udev(reason) => PartlockError::Udev(reason),
            LuksError::Io(io) => PartlockError::Io(io),
        }
    }
}

impl From<TpmError> for PartlockError {
    fn from(err: TpmError) -> Self {
        match err {
            TpmError::Read { .. } => PartlockError::TpmReadFailed(err.to_string()),
            TpmError::Seal(reason) => PartlockError::TpmSealFailed(reason),
            TpmError::Unseal(reason) => PartlockError::TpmUnsealFailed(reason),
            TpmError::Write { .. } => PartlockError::TpmWriteFailed(err.to_string()),
            TpmError::Io(io) => PartlockError::Io(io),
        }
    }
}
