//! Encryption strategies.
//!
//! Three ways to obtain the passphrase that creates or unlocks a LUKS
//! partition: a remote KMS reached over the discovery bus, a TPM PCR policy
//! enrolled for UKI boots, and a passphrase kept in TPM NV memory for
//! everything else. All three share the same shape: resolve the partition by
//! label, drive cryptsetup, and verify the result against a block layer that
//! settles on its own schedule.

use crate::config::{scan_kcrypt_config, KcryptConfig, PcrBindings};
use crate::validate::{validate_systemd_version, validate_tpm_device};
use crate::{PartlockError, PartlockResult};
use log::{debug, info, warn};
use partlock_block::{blkid_path, find_by_label, Partition, Paths};
use partlock_bus::{Bus, DiscoveryPayload, EVENT_DISCOVERY_PASSWORD};
use partlock_luks as luks;
use partlock_luks::UDEV_SETTLE_TIMEOUT;
use partlock_tpm::{
    get_or_create_passphrase, random_passphrase, SealedBlobStore, TpmTools, TPM_RESOURCE_DEVICE,
};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;
use uuid::Uuid;
use zeroize::Zeroizing;

/// Per-label unlock retry budget.
const UNLOCK_ATTEMPTS: u32 = 10;

/// Systemd version introducing the cryptenroll features we rely on.
const MIN_SYSTEMD_VERSION: u32 = 252;

/// Capability set every strategy provides.
pub trait EncryptionStrategy {
    /// Encrypt the partitions carrying `labels`. Returns one
    /// `label:name:uuid` triple per partition for caller persistence: the
    /// LUKS container hides the original label from userspace, so the caller
    /// must record the mapping itself.
    fn encrypt(&mut self, labels: &[String]) -> PartlockResult<Vec<String>>;

    /// Unlock the partitions carrying `labels`, returning only when each one
    /// is visible to userspace again.
    fn unlock(&mut self, labels: &[String]) -> PartlockResult<()>;

    /// Human-readable strategy name for logging.
    fn name(&self) -> &'static str;

    /// Check the strategy's prerequisites without touching any device.
    fn validate(&self) -> PartlockResult<()>;
}

/// The strategy chosen by the selector.
pub enum Encryptor {
    RemoteKms(RemoteKmsEncryptor),
    TpmPcr(TpmPcrEncryptor),
    LocalNv(LocalNvEncryptor),
}

impl EncryptionStrategy for Encryptor {
    fn encrypt(&mut self, labels: &[String]) -> PartlockResult<Vec<String>> {
        match self {
            Encryptor::RemoteKms(strategy) => strategy.encrypt(labels),
            Encryptor::TpmPcr(strategy) => strategy.encrypt(labels),
            Encryptor::LocalNv(strategy) => strategy.encrypt(labels),
        }
    }

    fn unlock(&mut self, labels: &[String]) -> PartlockResult<()> {
        match self {
            Encryptor::RemoteKms(strategy) => strategy.unlock(labels),
            Encryptor::TpmPcr(strategy) => strategy.unlock(labels),
            Encryptor::LocalNv(strategy) => strategy.unlock(labels),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Encryptor::RemoteKms(strategy) => strategy.name(),
            Encryptor::TpmPcr(strategy) => strategy.name(),
            Encryptor::LocalNv(strategy) => strategy.name(),
        }
    }

    fn validate(&self) -> PartlockResult<()> {
        match self {
            Encryptor::RemoteKms(strategy) => strategy.validate(),
            Encryptor::TpmPcr(strategy) => strategy.validate(),
            Encryptor::LocalNv(strategy) => strategy.validate(),
        }
    }
}

/// Resolved partition plus the derived paths the strategies work with.
pub(crate) struct PartitionInfo {
    pub device_path: String,
    pub name: String,
    pub partition: Partition,
}

impl PartitionInfo {
    pub(crate) fn mapper_path(&self) -> PathBuf {
        PathBuf::from("/dev/mapper").join(&self.name)
    }

    /// Locked means encrypted and not yet mapped.
    pub(crate) fn locked(&self) -> bool {
        !self.mapper_path().exists()
    }
}

pub(crate) fn find_partition_info(label: &str) -> PartlockResult<PartitionInfo> {
    let paths = Paths::detect(None);
    let partition = find_by_label(&paths, label)?;
    Ok(PartitionInfo {
        device_path: partition.path.clone(),
        name: partition.name.clone(),
        partition,
    })
}

/// `--uuid`/`--label` pair for a new container plus caller extras. The UUID
/// is derived from the label so re-encryption of the same label is stable.
fn creation_args(label: &str, extra: &[String]) -> Vec<String> {
    let uuid = Uuid::new_v5(&Uuid::NAMESPACE_URL, label.as_bytes());
    let mut args = vec![
        "--uuid".to_string(),
        uuid.to_string(),
        "--label".to_string(),
        label.to_string(),
    ];
    args.extend_from_slice(extra);
    args
}

/// Ten-attempt unlock loop shared by every strategy.
///
/// Attempt `i` sleeps `i` seconds first. Each attempt re-resolves the label,
/// returns early when the mapper already exists, asks the strategy to unlock
/// via `attempt`, and finally requires the label to be visible to `blkid`
/// again. Every intermediate failure is recorded and retried; exhaustion
/// wraps the last failure.
fn unlock_with_retries<F>(label: &str, mut attempt: F) -> PartlockResult<()>
where
    F: FnMut(&PartitionInfo) -> PartlockResult<()>,
{
    let mut last_err = PartlockError::PartitionNotFound(label.to_string());

    for round in 0..UNLOCK_ATTEMPTS {
        if round > 0 {
            info!("retrying unlock of {label} (attempt {round})");
            thread::sleep(Duration::from_secs(u64::from(round)));
        }

        let info = match find_partition_info(label) {
            Ok(info) => info,
            Err(err) => {
                debug!("failed to find partition {label}, will retry: {err}");
                last_err = err;
                continue;
            }
        };

        if !info.locked() {
            debug!("{label} already unlocked at {}", info.mapper_path().display());
            return Ok(());
        }

        if let Err(err) = attempt(&info) {
            warn!("unlock attempt for {label} failed, will retry: {err}");
            last_err = err;
            continue;
        }

        // The kernel can report success before the new node is usable;
        // trust only an independent lookup.
        if blkid_path(label).is_some() {
            info!("partition {label} unlocked and verified");
            return Ok(());
        }
        last_err = PartlockError::LuksUnlockFailed(format!(
            "partition {label} unlocked but not visible"
        ));
    }

    Err(PartlockError::UnlockExhausted {
        label: label.to_string(),
        attempts: UNLOCK_ATTEMPTS,
        source: Box::new(last_err),
    })
}

// ---------------------------------------------------------------------------
// Remote KMS

/// Encrypts and unlocks with passphrases served by a remote KMS through the
/// discovery bus (`kcrypt-challenger` or a compatible provider).
pub struct RemoteKmsEncryptor {
    config: Option<KcryptConfig>,
    bus: Bus,
    extra_args: Vec<String>,
}

impl RemoteKmsEncryptor {
    pub fn new(config: Option<KcryptConfig>) -> Self {
        Self::with_bus(config, Bus::new())
    }

    /// Use an explicit bus (tests, alternative provider sets).
    pub fn with_bus(config: Option<KcryptConfig>, bus: Bus) -> Self {
        Self {
            config,
            bus,
            extra_args: Vec::new(),
        }
    }

    /// Extra `cryptsetup luksFormat` arguments appended on encryption.
    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    fn request_passphrase(&mut self, partition: &Partition) -> PartlockResult<Zeroizing<String>> {
        info!(
            "requesting password for partition {} (label {}, uuid {})",
            partition.name, partition.filesystem_label, partition.uuid
        );

        // An explicitly provided config wins; otherwise scan on demand.
        let config = match &self.config {
            Some(config) => Some(config.clone()),
            None => scan_kcrypt_config(None),
        };

        let mut payload = DiscoveryPayload {
            partition: partition.clone(),
            ..DiscoveryPayload::default()
        };
        match config {
            Some(config) => {
                payload.challenger_server = config.challenger_server;
                payload.mdns = config.mdns;
                info!("using challenger server `{}`", payload.challenger_server);
            }
            None => info!("no kcrypt config provided, relying on provider defaults"),
        }

        let data = self
            .bus
            .publish_expecting_data(EVENT_DISCOVERY_PASSWORD, &payload)?;
        info!(
            "received passphrase from discovery provider ({} bytes)",
            data.len()
        );
        Ok(Zeroizing::new(data))
    }

    /// Recreate the partition behind `label` as a LUKS container.
    /// THIS OVERWRITES DATA.
    fn luksify(&mut self, label: &str) -> PartlockResult<String> {
        info!("running udev settle");
        luks::trigger_and_settle(UDEV_SETTLE_TIMEOUT)?;

        info!("finding partition {label}");
        let target = find_partition_info(label)?;

        let passphrase = self.request_passphrase(&target.partition)?;

        let mapper = target.mapper_path();
        let device = &target.device_path;
        let args = creation_args(label, &self.extra_args);

        luks::unmount_if_mounted(device)?;
        luks::create_luks(device, &passphrase, &args)?;
        luks::format_luks(
            device,
            &target.name,
            &mapper.to_string_lossy(),
            label,
            &passphrase,
        )?;

        info!("partition {label} encrypted");
        Ok(format!(
            "{}:{}:{}",
            target.partition.filesystem_label, target.name, target.partition.uuid
        ))
    }
}

impl EncryptionStrategy for RemoteKmsEncryptor {
    fn encrypt(&mut self, labels: &[String]) -> PartlockResult<Vec<String>> {
        info!("encrypting partitions {labels:?} via {}", self.name());
        let mut triples = Vec::with_capacity(labels.len());
        for label in labels {
            triples.push(self.luksify(label)?);
        }
        Ok(triples)
    }

    fn unlock(&mut self, labels: &[String]) -> PartlockResult<()> {
        info!("unlocking partitions {labels:?} via {}", self.name());
        for label in labels {
            let strategy = &mut *self;
            unlock_with_retries(label, move |target| {
                let passphrase = strategy.request_passphrase(&target.partition)?;
                luks::luks_unlock(&target.device_path, &target.name, &passphrase)
                    .map_err(PartlockError::from)
            })?;
        }
        info!("all partitions unlocked");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Remote KMS"
    }

    fn validate(&self) -> PartlockResult<()> {
        // Nothing to check up front; the challenger is probed on first use.
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TPM with PCR policy (UKI)

/// Encrypts with a throwaway passphrase and enrolls a signed PCR policy as
/// the only remaining unlock path. Unlocks via systemd-cryptsetup.
pub struct TpmPcrEncryptor {
    bind_public_pcrs: Vec<String>,
    bind_pcrs: Vec<String>,
    extra_args: Vec<String>,
    tpm_probe: PathBuf,
}

impl TpmPcrEncryptor {
    pub fn new(bindings: PcrBindings) -> Self {
        Self {
            bind_public_pcrs: bindings.bind_public_pcrs,
            bind_pcrs: bindings.bind_pcrs,
            extra_args: Vec::new(),
            tpm_probe: PathBuf::from(TPM_RESOURCE_DEVICE),
        }
    }

    /// Extra `cryptsetup luksFormat` arguments appended on encryption.
    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// Override the TPM device probe (tests).
    pub fn with_tpm_probe(mut self, probe: impl Into<PathBuf>) -> Self {
        self.tpm_probe = probe.into();
        self
    }

    pub fn bind_pcrs(&self) -> &[String] {
        &self.bind_pcrs
    }

    pub fn bind_public_pcrs(&self) -> &[String] {
        &self.bind_public_pcrs
    }

    /// Encrypt one partition and bind it to the current boot's measurements.
    ///
    /// The throwaway passphrase exists only long enough to format the inner
    /// filesystem; the final wipe leaves the PCR policy as the only keyslot.
    fn luksify_measurements(&self, label: &str) -> PartlockResult<()> {
        luks::trigger_and_settle(UDEV_SETTLE_TIMEOUT)?;

        let target = find_partition_info(label)?;
        let passphrase = random_passphrase(32);
        let mapper = target.mapper_path();
        let device = &target.device_path;
        let args = creation_args(label, &self.extra_args);

        luks::unmount_if_mounted(device)?;
        luks::create_luks(device, &passphrase, &args)?;

        // The header must be on disk before cryptenroll reopens the device.
        nix::unistd::sync();

        luks::enroll_pcr_policy(device, &passphrase, &self.bind_public_pcrs, &self.bind_pcrs)?;
        luks::format_luks(
            device,
            &target.name,
            &mapper.to_string_lossy(),
            label,
            &passphrase,
        )?;
        luks::wipe_password_slot(device)?;
        Ok(())
    }
}

impl EncryptionStrategy for TpmPcrEncryptor {
    fn encrypt(&mut self, labels: &[String]) -> PartlockResult<Vec<String>> {
        info!("encrypting partitions {labels:?} via {}", self.name());
        for label in labels {
            self.luksify_measurements(label)?;
            info!("partition {label} encrypted and bound to PCR policy");
        }
        Ok(Vec::new())
    }

    fn unlock(&mut self, labels: &[String]) -> PartlockResult<()> {
        info!("unlocking partitions {labels:?} via {}", self.name());
        for label in labels {
            unlock_with_retries(label, |target| {
                luks::tpm_attach(&target.name, &target.device_path)
                    .map_err(PartlockError::from)
            })?;
        }
        info!("all partitions unlocked");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TPM with PCR policy"
    }

    fn validate(&self) -> PartlockResult<()> {
        validate_systemd_version(MIN_SYSTEMD_VERSION)?;
        validate_tpm_device(&self.tpm_probe)
    }
}

// ---------------------------------------------------------------------------
// Local TPM NV passphrase

/// Encrypts and unlocks with a passphrase sealed in TPM NV memory, without
/// any remote dependency or the plugin bus.
pub struct LocalNvEncryptor {
    config: Option<KcryptConfig>,
    store: Box<dyn SealedBlobStore>,
    extra_args: Vec<String>,
    tpm_probe: PathBuf,
}

impl LocalNvEncryptor {
    pub fn new(config: Option<KcryptConfig>) -> Self {
        Self::with_store(config, Box::new(TpmTools))
    }

    /// Use an explicit blob store (tests).
    pub fn with_store(config: Option<KcryptConfig>, store: Box<dyn SealedBlobStore>) -> Self {
        Self {
            config,
            store,
            extra_args: Vec::new(),
            tpm_probe: PathBuf::from(TPM_RESOURCE_DEVICE),
        }
    }

    /// Extra `cryptsetup luksFormat` arguments appended on encryption.
    pub fn with_extra_args(mut self, extra_args: Vec<String>) -> Self {
        self.extra_args = extra_args;
        self
    }

    /// Override the TPM device probe (tests).
    pub fn with_tpm_probe(mut self, probe: impl Into<PathBuf>) -> Self {
        self.tpm_probe = probe.into();
        self
    }

    fn passphrase(&self) -> PartlockResult<Zeroizing<String>> {
        let (nv_index, c_index, tpm_device) = match &self.config {
            Some(config) => (
                config.nv_index.as_str(),
                config.c_index.as_str(),
                config.tpm_device.as_str(),
            ),
            None => ("", "", ""),
        };
        let passphrase =
            get_or_create_passphrase(self.store.as_ref(), nv_index, c_index, tpm_device)?;
        info!(
            "retrieved passphrase from local TPM NV memory ({} bytes)",
            passphrase.len()
        );
        Ok(passphrase)
    }
}

impl EncryptionStrategy for LocalNvEncryptor {
    fn encrypt(&mut self, labels: &[String]) -> PartlockResult<Vec<String>> {
        info!("encrypting partitions {labels:?} via {}", self.name());
        let passphrase = self.passphrase()?;

        let mut triples = Vec::with_capacity(labels.len());
        for label in labels {
            luks::trigger_and_settle(UDEV_SETTLE_TIMEOUT)?;

            let target = find_partition_info(label)?;
            let mapper = target.mapper_path();
            let args = creation_args(label, &self.extra_args);

            luks::unmount_if_mounted(&target.device_path)?;
            luks::create_luks(&target.device_path, &passphrase, &args)?;
            luks::format_luks(
                &target.device_path,
                &target.name,
                &mapper.to_string_lossy(),
                label,
                &passphrase,
            )?;

            info!("partition {label} encrypted");
            triples.push(format!(
                "{}:{}:{}",
                target.partition.filesystem_label, target.name, target.partition.uuid
            ));
        }
        Ok(triples)
    }

    fn unlock(&mut self, labels: &[String]) -> PartlockResult<()> {
        info!("unlocking partitions {labels:?} via {}", self.name());
        for label in labels {
            unlock_with_retries(label, |target| {
                let passphrase = self.passphrase()?;
                luks::luks_unlock(&target.device_path, &target.name, &passphrase)
                    .map_err(PartlockError::from)
            })?;
        }
        info!("all partitions unlocked");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Local TPM NV passphrase"
    }

    fn validate(&self) -> PartlockResult<()> {
        validate_tpm_device(&self.tpm_probe)
    }
}
