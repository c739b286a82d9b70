//! Provider discovery and execution.
//!
//! Providers are standalone executables discovered by filename prefix. Each
//! request spawns the provider, writes one JSON envelope to its stdin, and
//! reads one JSON response from its stdout.

use crate::events::{EventEnvelope, EventResponse};
use crate::{BusError, BusResult};
use log::{debug, warn};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// One autoloaded provider executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provider {
    pub name: String,
    pub executable: PathBuf,
}

impl Provider {
    /// Run the provider for one event and parse its response.
    pub(crate) fn call(&self, event: &str, payload_json: &str) -> BusResult<EventResponse> {
        let envelope = EventEnvelope {
            name: event.to_string(),
            data: payload_json.to_string(),
        };
        let input = serde_json::to_string(&envelope)?;

        debug!(
            "publishing {event} to provider {} at {}",
            self.name,
            self.executable.display()
        );

        let mut child = Command::new(&self.executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| BusError::Provider {
                provider: self.name.clone(),
                reason: format!("spawn failed: {err}"),
            })?;

        child
            .stdin
            .take()
            .expect("stdin was piped")
            .write_all(input.as_bytes())
            .map_err(|err| BusError::Provider {
                provider: self.name.clone(),
                reason: format!("writing event: {err}"),
            })?;

        let output = child.wait_with_output().map_err(|err| BusError::Provider {
            provider: self.name.clone(),
            reason: format!("collecting output: {err}"),
        })?;

        if !output.status.success() {
            return Err(BusError::Provider {
                provider: self.name.clone(),
                reason: format!(
                    "exited with {:?}: {}",
                    output.status.code(),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }

        serde_json::from_slice::<EventResponse>(&output.stdout).map_err(|err| {
            BusError::Provider {
                provider: self.name.clone(),
                reason: format!("malformed response: {err}"),
            }
        })
    }
}

/// Discover executables whose file name starts with `prefix` in `paths`.
/// Unreadable directories are skipped; the order is deterministic (paths in
/// the given order, files sorted within each path).
pub(crate) fn autoload(prefix: &str, paths: &[PathBuf]) -> Vec<Provider> {
    let mut providers = Vec::new();
    for dir in paths {
        let Ok(entries) = fs::read_dir(dir) else {
            debug!("provider path {} not readable, skipping", dir.display());
            continue;
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        files.sort();

        for file in files {
            let Some(name) = file.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !name.starts_with(prefix) {
                continue;
            }
            if !is_executable(&file) {
                warn!("skipping non-executable provider candidate {}", file.display());
                continue;
            }
            providers.push(Provider {
                name: name.to_string(),
                executable: file,
            });
        }
    }
    providers
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
