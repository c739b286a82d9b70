//! Effective kcrypt configuration.
//!
//! The collector produces one merged dynamic tree from the config
//! directories and the kernel command line; this module extracts the kcrypt
//! fields out of it. Two on-disk layouts are accepted and produce the same
//! struct: fields directly below `kcrypt:` and fields inside a nested
//! `kcrypt.challenger:` block (nested values win). The command line reaches
//! the same place through `kairos.kcrypt.*` dotted keys.

use crate::{PartlockError, PartlockResult};
use log::{debug, warn};
use partlock_collector::{scan, Config, Options};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::PathBuf;

/// Directories scanned for kcrypt configuration by default.
pub use partlock_collector::DEFAULT_SCAN_DIRS as DEFAULT_CONFIG_DIRS;

/// Effective kcrypt configuration. All-empty fields and "no config found"
/// are treated identically by every consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct KcryptConfig {
    /// Remote KMS endpoint; non-empty selects the remote strategy.
    #[serde(default)]
    pub challenger_server: String,

    /// Discover the KMS over mDNS instead of (or besides) a fixed endpoint.
    #[serde(default)]
    pub mdns: bool,

    /// PEM certificate pinning the KMS identity.
    #[serde(default)]
    pub certificate: String,

    /// TPM NV index holding the sealed local passphrase (hex string).
    #[serde(default)]
    pub nv_index: String,

    /// Sealing index protecting the passphrase blob (hex string).
    #[serde(default)]
    pub c_index: String,

    /// TPM device path override.
    #[serde(default)]
    pub tpm_device: String,
}

impl KcryptConfig {
    /// Whether the remote KMS should be used.
    pub fn wants_remote(&self) -> bool {
        !self.challenger_server.is_empty() || self.mdns
    }
}

/// PCR-binding lists used by the TPM+PCR strategy in UKI mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcrBindings {
    /// Registers bound directly; a changed measurement stops unlocking.
    pub bind_pcrs: Vec<String>,
    /// Registers bound via the signed policy; anything signed by the same
    /// key keeps unlocking, which is what allows upgrades against PCR 11.
    pub bind_public_pcrs: Vec<String>,
}

/// Merge all configured sources into one tree. Failures degrade to `None`:
/// a host without config must still boot.
pub fn scan_merged_config(dirs: Option<&[PathBuf]>) -> Option<Config> {
    let scan_dirs = match dirs {
        Some(dirs) => dirs.to_vec(),
        None => DEFAULT_CONFIG_DIRS.iter().map(PathBuf::from).collect(),
    };
    debug!("scanning for configuration in {scan_dirs:?}");
    let options = Options {
        scan_dirs,
        ..Options::default()
    };
    match scan(&options) {
        Ok(config) => Some(config),
        Err(err) => {
            warn!("configuration scan failed, continuing without config: {err}");
            None
        }
    }
}

/// Scan and extract in one step.
pub fn scan_kcrypt_config(dirs: Option<&[PathBuf]>) -> Option<KcryptConfig> {
    let merged = scan_merged_config(dirs)?;
    extract_kcrypt_config(&merged.values)
}

/// Extract the kcrypt configuration from a merged tree, `None` when no
/// kcrypt section exists anywhere.
pub fn extract_kcrypt_config(values: &Mapping) -> Option<KcryptConfig> {
    let kcrypt = kcrypt_mapping(values)?;
    let challenger = kcrypt.get("challenger").and_then(Value::as_mapping);

    let field = |key: &str| {
        challenger
            .and_then(|block| block.get(key))
            .or_else(|| kcrypt.get(key))
    };

    Some(KcryptConfig {
        challenger_server: field("challenger_server")
            .and_then(string_value)
            .unwrap_or_default(),
        mdns: field("mdns").map(bool_value).unwrap_or_default(),
        certificate: field("certificate")
            .and_then(string_value)
            .unwrap_or_default(),
        nv_index: field("nv_index").and_then(index_value).unwrap_or_default(),
        c_index: field("c_index").and_then(index_value).unwrap_or_default(),
        tpm_device: field("tpm_device")
            .and_then(string_value)
            .unwrap_or_default(),
    })
}

/// Extract `bind-pcrs` / `bind-public-pcrs` from a merged tree, tolerating
/// both homogeneous-string and mixed scalar sequences.
pub fn extract_pcr_bindings(values: &Mapping) -> PcrBindings {
    PcrBindings {
        bind_pcrs: pcr_list(values, "bind-pcrs"),
        bind_public_pcrs: pcr_list(values, "bind-public-pcrs"),
    }
}

/// Require a well-formed list where present; used by callers that want
/// malformed PCR configuration to be loud instead of silently unbound.
pub fn require_pcr_bindings(values: &Mapping) -> PartlockResult<PcrBindings> {
    for key in ["bind-pcrs", "bind-public-pcrs"] {
        if let Some(value) = values.get(key) {
            if !value.is_sequence() {
                return Err(PartlockError::ConfigParse(format!(
                    "{key} must be a sequence of PCR numbers"
                )));
            }
        }
    }
    Ok(extract_pcr_bindings(values))
}

fn kcrypt_mapping(values: &Mapping) -> Option<&Mapping> {
    if let Some(kcrypt) = values
        .get("kairos")
        .and_then(Value::as_mapping)
        .and_then(|kairos| kairos.get("kcrypt"))
        .and_then(Value::as_mapping)
    {
        debug!("kcrypt config found under kairos.kcrypt");
        return Some(kcrypt);
    }
    let kcrypt = values.get("kcrypt").and_then(Value::as_mapping);
    if kcrypt.is_some() {
        debug!("kcrypt config found at top level");
    }
    kcrypt
}

fn pcr_list(values: &Mapping, key: &str) -> Vec<String> {
    let Some(sequence) = values.get(key).and_then(Value::as_sequence) else {
        return Vec::new();
    };
    sequence
        .iter()
        .filter_map(|item| match item {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        })
        .collect()
}

fn string_value(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

/// NV indexes are hex strings; a YAML author writing `nv_index: 0x1500000`
/// unquoted produces an integer, which is folded back into hex form.
fn index_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => number.as_u64().map(|index| format!("{index:#x}")),
        _ => None,
    }
}

fn bool_value(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::String(text) => text == "true",
        _ => false,
    }
}
