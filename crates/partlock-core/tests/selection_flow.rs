//! End-to-end selection: merged config sources feed the selector.

use partlock_collector::{scan, Options};
use partlock_core::{
    extract_kcrypt_config, extract_pcr_bindings, EncryptionStrategy, PcrBindings, Selector,
};
use std::fs;
use std::path::PathBuf;
use tempfile::tempdir;

fn scan_sources(yaml: Option<&str>, cmdline: &str) -> partlock_collector::Config {
    let dir = tempdir().unwrap();
    let oem = dir.path().join("oem");
    fs::create_dir_all(&oem).unwrap();
    if let Some(yaml) = yaml {
        fs::write(oem.join("90_custom.yaml"), yaml).unwrap();
    }
    let cmdline_file = dir.path().join("cmdline");
    fs::write(&cmdline_file, cmdline).unwrap();

    let options = Options {
        scan_dirs: vec![oem],
        merge_boot_cmdline: true,
        boot_cmdline_file: cmdline_file,
        follow_config_url: false,
    };
    scan(&options).unwrap()
}

#[test]
fn cmdline_only_kcrypt_config_selects_remote_kms() {
    let merged = scan_sources(
        None,
        "BOOT_IMAGE=/vmlinuz kairos.kcrypt.challenger_server=kms.local kairos.kcrypt.mdns=true",
    );

    let config = extract_kcrypt_config(&merged.values).unwrap();
    assert_eq!(config.challenger_server, "kms.local");
    assert!(config.mdns);

    let encryptor = Selector::choose(Some(&config), false, PcrBindings::default());
    assert_eq!(encryptor.name(), "Remote KMS");
}

#[test]
fn file_config_and_cmdline_merge_before_extraction() {
    let merged = scan_sources(
        Some(
            "#cloud-config\nkcrypt:\n  challenger:\n    challenger_server: from-file.example\n",
        ),
        "kairos.kcrypt.nv_index=0x1500001",
    );

    let config = extract_kcrypt_config(&merged.values).unwrap();
    // The file places data under `kcrypt`, the cmdline under `kairos.kcrypt`;
    // the kairos subtree wins the lookup and both must survive the merge.
    assert_eq!(config.nv_index, "0x1500001");

    let top_level = {
        let mut values = merged.values.clone();
        values.remove("kairos");
        extract_kcrypt_config(&values).unwrap()
    };
    assert_eq!(top_level.challenger_server, "from-file.example");
}

#[test]
fn uki_bindings_flow_from_the_same_merged_tree() {
    let merged = scan_sources(
        Some("#cloud-config\nbind-pcrs: [\"7\"]\nbind-public-pcrs: [\"11\"]\n"),
        "quiet",
    );

    let bindings = extract_pcr_bindings(&merged.values);
    let encryptor = Selector::choose(None, true, bindings);
    assert_eq!(encryptor.name(), "TPM with PCR policy");
}
