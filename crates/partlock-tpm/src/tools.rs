//! [`SealedBlobStore`] over the host tpm2-tools.
//!
//! Sealing uses a primary object under the owner hierarchy and a sealed
//! keyed-hash object created from it. When an auth index is configured its
//! NV contents (hex-encoded) become the auth secret of the sealed object, so
//! a blob lifted off the disk cannot be unsealed without that second index.
//!
//! Blob layout: 4-byte big-endian length of the public area, public area,
//! private area.

use crate::command::run_tool;
use crate::{SealedBlobStore, TpmError, TpmOpts, TpmResult};
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Production store shelling out to tpm2-tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct TpmTools;

impl TpmTools {
    fn tcti_args(opts: &TpmOpts) -> Vec<String> {
        match &opts.device {
            Some(device) => vec!["-T".to_string(), format!("device:{device}")],
            None => Vec::new(),
        }
    }

    /// Auth secret from the configured auth index, hex-encoded for `-p`.
    fn auth_secret(&self, opts: &TpmOpts) -> TpmResult<Option<String>> {
        let Some(auth_index) = &opts.auth_index else {
            return Ok(None);
        };
        let contents = self.read_blob(&TpmOpts {
            nv_index: Some(auth_index.clone()),
            auth_index: None,
            device: opts.device.clone(),
        })?;
        Ok(Some(format!("hex:{}", hex::encode(contents))))
    }

    fn create_primary(&self, opts: &TpmOpts, context: &Path) -> TpmResult<()> {
        let mut args = vec![
            "-Q".to_string(),
            "-C".to_string(),
            "o".to_string(),
            "-c".to_string(),
            context.display().to_string(),
        ];
        args.extend(Self::tcti_args(opts));
        let result = run_tool("tpm2_createprimary", &args).map_err(io_seal)?;
        if !result.success {
            return Err(TpmError::Seal(format!(
                "tpm2_createprimary: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

impl SealedBlobStore for TpmTools {
    fn read_blob(&self, opts: &TpmOpts) -> TpmResult<Vec<u8>> {
        let index = required_index(opts);
        let mut args = vec![index.clone()];
        args.extend(Self::tcti_args(opts));
        let result = run_tool("tpm2_nvread", &args).map_err(|err| TpmError::Read {
            index: index.clone(),
            reason: err.to_string(),
        })?;
        if !result.success {
            return Err(TpmError::Read {
                index,
                reason: result.stderr.trim().to_string(),
            });
        }
        Ok(result.stdout)
    }

    fn store_blob(&self, blob: &[u8], opts: &TpmOpts) -> TpmResult<()> {
        let index = required_index(opts);
        let dir = tempdir().map_err(TpmError::Io)?;
        let blob_path = dir.path().join("blob");
        fs::write(&blob_path, blob)?;

        // Replace any stale definition; the old size may not match.
        let mut undefine = vec![index.clone()];
        undefine.extend(Self::tcti_args(opts));
        if let Ok(result) = run_tool("tpm2_nvundefine", &undefine) {
            if !result.success {
                log::debug!("tpm2_nvundefine {index}: {}", result.stderr.trim());
            }
        }

        let mut define = vec![
            "-Q".to_string(),
            "-s".to_string(),
            blob.len().to_string(),
            index.clone(),
        ];
        define.extend(Self::tcti_args(opts));
        let result = run_tool("tpm2_nvdefine", &define).map_err(|err| write_err(&index, err))?;
        if !result.success {
            return Err(TpmError::Write {
                index,
                reason: format!("tpm2_nvdefine: {}", result.stderr.trim()),
            });
        }

        let mut write = vec![
            "-Q".to_string(),
            "-i".to_string(),
            blob_path.display().to_string(),
            index.clone(),
        ];
        write.extend(Self::tcti_args(opts));
        let result = run_tool("tpm2_nvwrite", &write).map_err(|err| write_err(&index, err))?;
        if !result.success {
            return Err(TpmError::Write {
                index,
                reason: format!("tpm2_nvwrite: {}", result.stderr.trim()),
            });
        }
        Ok(())
    }

    fn encrypt_blob(&self, data: &[u8], opts: &TpmOpts) -> TpmResult<Vec<u8>> {
        let dir = tempdir().map_err(TpmError::Io)?;
        let primary = dir.path().join("primary.ctx");
        let secret = dir.path().join("secret");
        let public = dir.path().join("sealed.pub");
        let private = dir.path().join("sealed.priv");

        self.create_primary(opts, &primary)?;
        fs::write(&secret, data)?;

        let mut args = vec![
            "-Q".to_string(),
            "-C".to_string(),
            primary.display().to_string(),
            "-i".to_string(),
            secret.display().to_string(),
            "-u".to_string(),
            public.display().to_string(),
            "-r".to_string(),
            private.display().to_string(),
        ];
        if let Some(auth) = self.auth_secret(opts)? {
            args.push("-p".to_string());
            args.push(auth);
        }
        args.extend(Self::tcti_args(opts));

        let result = run_tool("tpm2_create", &args).map_err(io_seal)?;
        if !result.success {
            return Err(TpmError::Seal(format!(
                "tpm2_create: {}",
                result.stderr.trim()
            )));
        }

        let public_bytes = fs::read(&public)?;
        let private_bytes = fs::read(&private)?;
        let mut blob = Vec::with_capacity(4 + public_bytes.len() + private_bytes.len());
        blob.extend_from_slice(&(public_bytes.len() as u32).to_be_bytes());
        blob.extend_from_slice(&public_bytes);
        blob.extend_from_slice(&private_bytes);
        Ok(blob)
    }

    fn decrypt_blob(&self, blob: &[u8], opts: &TpmOpts) -> TpmResult<Vec<u8>> {
        let (public_bytes, private_bytes) = split_blob(blob)?;

        let dir = tempdir().map_err(TpmError::Io)?;
        let primary = dir.path().join("primary.ctx");
        let public = dir.path().join("sealed.pub");
        let private = dir.path().join("sealed.priv");
        let sealed = dir.path().join("sealed.ctx");
        fs::write(&public, public_bytes)?;
        fs::write(&private, private_bytes)?;

        self.create_primary(opts, &primary)?;

        let mut load = vec![
            "-Q".to_string(),
            "-C".to_string(),
            primary.display().to_string(),
            "-u".to_string(),
            public.display().to_string(),
            "-r".to_string(),
            private.display().to_string(),
            "-c".to_string(),
            sealed.display().to_string(),
        ];
        load.extend(Self::tcti_args(opts));
        let result = run_tool("tpm2_load", &load).map_err(io_unseal)?;
        if !result.success {
            return Err(TpmError::Unseal(format!(
                "tpm2_load: {}",
                result.stderr.trim()
            )));
        }

        let mut unseal = vec!["-c".to_string(), sealed.display().to_string()];
        if let Some(auth) = self.auth_secret(opts)? {
            unseal.push("-p".to_string());
            unseal.push(auth);
        }
        unseal.extend(Self::tcti_args(opts));
        let result = run_tool("tpm2_unseal", &unseal).map_err(io_unseal)?;
        if !result.success {
            return Err(TpmError::Unseal(format!(
                "tpm2_unseal: {}",
                result.stderr.trim()
            )));
        }
        Ok(result.stdout)
    }
}

fn split_blob(blob: &[u8]) -> TpmResult<(&[u8], &[u8])> {
    if blob.len() < 4 {
        return Err(TpmError::Unseal("blob too short".to_string()));
    }
    let public_len = u32::from_be_bytes([blob[0], blob[1], blob[2], blob[3]]) as usize;
    let rest = &blob[4..];
    if public_len > rest.len() {
        return Err(TpmError::Unseal("blob public-area length out of range".to_string()));
    }
    Ok(rest.split_at(public_len))
}

fn required_index(opts: &TpmOpts) -> String {
    opts.nv_index
        .clone()
        .unwrap_or_else(|| crate::DEFAULT_NV_INDEX.to_string())
}

fn io_seal(err: std::io::Error) -> TpmError {
    TpmError::Seal(err.to_string())
}

fn io_unseal(err: std::io::Error) -> TpmError {
    TpmError::Unseal(err.to_string())
}

fn write_err(index: &str, err: std::io::Error) -> TpmError {
    TpmError::Write {
        index: index.to_string(),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_blob_rejects_truncated_input() {
        assert!(split_blob(&[0, 0]).is_err());
        assert!(split_blob(&[0, 0, 0, 9, 1, 2]).is_err());
    }

    #[test]
    fn split_blob_partitions_public_and_private() {
        let mut blob = vec![0, 0, 0, 2];
        blob.extend_from_slice(b"pubpriv");
        let (public, private) = split_blob(&blob).unwrap();
        assert_eq!(public, b"pu");
        assert_eq!(private, b"bpriv");
    }
}
