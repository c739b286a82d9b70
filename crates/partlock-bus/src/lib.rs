#![forbid(unsafe_code)]

//! Single-event plugin bus.
//!
//! The bus autoloads provider executables from well-known paths, publishes
//! typed events to them as JSON over pipes, and collects a single response
//! per request. Publishing is blocking and strictly single-threaded;
//! providers are never assumed to be thread-safe.

mod events;
mod provider;

use log::{debug, info};
use serde::Serialize;
use std::env;
use std::path::PathBuf;

pub use events::{DiscoveryPayload, EventEnvelope, EventResponse, EVENT_DISCOVERY_PASSWORD};
pub use provider::Provider;

/// Default filename prefix for general agent providers.
pub const DEFAULT_PROVIDER_PREFIX: &str = "agent-provider";

/// Filename prefix of passphrase-discovery providers (e.g.
/// `kcrypt-discovery-challenger`).
pub const DISCOVERY_PROVIDER_PREFIX: &str = "kcrypt-discovery";

/// Paths searched for general providers, besides the working directory.
pub const DEFAULT_PROVIDER_PATHS: &[&str] = &["/system/providers", "/usr/local/system/providers"];

/// Paths searched for discovery providers.
pub const DISCOVERY_PROVIDER_PATHS: &[&str] = &["/system/discovery", "/usr/local/system/discovery"];

/// Environment variable elevating bus logging to debug detail.
pub const BUS_DEBUG_ENV: &str = "BUS_DEBUG";

/// Errors raised while publishing to providers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to encode event payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// A provider could not be executed or answered garbage.
    #[error("provider {provider}: {reason}")]
    Provider { provider: String, reason: String },

    /// A provider answered with an error payload. Fatal at the call site.
    #[error("failed discovery: {0}")]
    Plugin(String),

    /// No provider produced a non-empty response.
    #[error("no provider answered event {0}")]
    NoResponse(String),
}

pub type BusResult<T> = Result<T, BusError>;

/// A prefix plus the paths it is autoloaded from.
#[derive(Debug, Clone)]
pub struct ProviderSet {
    pub prefix: String,
    pub paths: Vec<PathBuf>,
}

/// In-process registry of provider executables.
///
/// Construct once, thread through whoever publishes; `initialize` is a no-op
/// when already done and `reload` rebuilds the provider list from disk.
#[derive(Debug, Default)]
pub struct Bus {
    sets: Vec<ProviderSet>,
    providers: Vec<Provider>,
    initialized: bool,
    verbose: bool,
}

impl Bus {
    /// Bus with the default provider sets: `agent-provider` executables from
    /// the system provider paths and the working directory, plus
    /// `kcrypt-discovery` executables from the system discovery paths.
    pub fn new() -> Self {
        let mut provider_paths: Vec<PathBuf> =
            DEFAULT_PROVIDER_PATHS.iter().map(PathBuf::from).collect();
        if let Ok(cwd) = env::current_dir() {
            provider_paths.push(cwd);
        }
        let sets = vec![
            ProviderSet {
                prefix: DEFAULT_PROVIDER_PREFIX.to_string(),
                paths: provider_paths,
            },
            ProviderSet {
                prefix: DISCOVERY_PROVIDER_PREFIX.to_string(),
                paths: DISCOVERY_PROVIDER_PATHS.iter().map(PathBuf::from).collect(),
            },
        ];
        Self::with_sets(sets)
    }

    /// Bus with explicit provider sets.
    pub fn with_sets(sets: Vec<ProviderSet>) -> Self {
        Self {
            sets,
            providers: Vec::new(),
            initialized: false,
            verbose: env::var(BUS_DEBUG_ENV).is_ok_and(|value| value == "true"),
        }
    }

    /// Autoload providers. Calling again without `reload` is a no-op.
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        self.load_providers();
        self.initialized = true;
    }

    /// Drop and re-discover the provider set.
    pub fn reload(&mut self) {
        self.providers.clear();
        self.load_providers();
        self.initialized = true;
    }

    /// The providers currently registered.
    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    /// Publish `payload` for `event` and return the collected response.
    ///
    /// Providers run sequentially in registration order; the first provider
    /// that answers with data (or an error) settles the request. An error
    /// payload is fatal. When every provider stays silent the last empty
    /// response is returned so the caller can decide.
    pub fn publish<P: Serialize>(&mut self, event: &str, payload: &P) -> BusResult<EventResponse> {
        self.initialize();

        let payload_json = serde_json::to_string(payload)?;
        self.log(format_args!(
            "publishing {event} to {} provider(s)",
            self.providers.len()
        ));

        let mut response = EventResponse::default();
        for provider in &self.providers {
            match provider.call(event, &payload_json) {
                Ok(answer) => {
                    if answer.errored() {
                        return Err(BusError::Plugin(answer.error));
                    }
                    if !answer.state.is_empty() {
                        self.log(format_args!(
                            "provider {} reported state {}",
                            provider.name, answer.state
                        ));
                    }
                    if !answer.data.is_empty() {
                        self.log(format_args!(
                            "provider {} answered {event} ({} bytes)",
                            provider.name,
                            answer.data.len()
                        ));
                        return Ok(answer);
                    }
                    response = answer;
                }
                Err(err) => {
                    // A broken provider must not mask a working one.
                    debug!("{err}");
                }
            }
        }

        Ok(response)
    }

    /// Publish and require a non-empty `data` field.
    pub fn publish_expecting_data<P: Serialize>(
        &mut self,
        event: &str,
        payload: &P,
    ) -> BusResult<String> {
        let response = self.publish(event, payload)?;
        if response.data.is_empty() {
            return Err(BusError::NoResponse(event.to_string()));
        }
        Ok(response.data)
    }

    fn load_providers(&mut self) {
        for set in &self.sets {
            let mut found = provider::autoload(&set.prefix, &set.paths);
            self.providers.append(&mut found);
        }
        self.log(format_args!(
            "bus loaded {} provider(s)",
            self.providers.len()
        ));
    }

    // BUS_DEBUG=true promotes bus chatter to info so it shows up without
    // reconfiguring the global logger.
    fn log(&self, args: std::fmt::Arguments<'_>) {
        if self.verbose {
            info!("{args}");
        } else {
            debug!("{args}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::tempdir;

    fn write_executable(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    fn bus_for(dir: &Path, prefix: &str) -> Bus {
        Bus::with_sets(vec![ProviderSet {
            prefix: prefix.to_string(),
            paths: vec![dir.to_path_buf()],
        }])
    }

    #[test]
    fn publish_collects_the_provider_response() {
        let dir = tempdir().unwrap();
        write_executable(
            &dir.path().join("kcrypt-discovery-test"),
            "#!/bin/sh\ncat > /dev/null\nprintf '{\"data\":\"s3cr3t\",\"state\":\"\",\"error\":\"\"}'\n",
        );

        let mut bus = bus_for(dir.path(), "kcrypt-discovery");
        let data = bus
            .publish_expecting_data(EVENT_DISCOVERY_PASSWORD, &DiscoveryPayload::default())
            .unwrap();
        assert_eq!(data, "s3cr3t");
    }

    #[test]
    fn provider_error_payload_is_fatal() {
        let dir = tempdir().unwrap();
        write_executable(
            &dir.path().join("kcrypt-discovery-bad"),
            "#!/bin/sh\ncat > /dev/null\nprintf '{\"data\":\"\",\"state\":\"\",\"error\":\"no quorum\"}'\n",
        );

        let mut bus = bus_for(dir.path(), "kcrypt-discovery");
        let err = bus
            .publish(EVENT_DISCOVERY_PASSWORD, &DiscoveryPayload::default())
            .unwrap_err();
        assert!(matches!(err, BusError::Plugin(reason) if reason == "no quorum"));
    }

    #[test]
    fn empty_data_maps_to_no_response() {
        let dir = tempdir().unwrap();
        write_executable(
            &dir.path().join("kcrypt-discovery-silent"),
            "#!/bin/sh\ncat > /dev/null\nprintf '{\"data\":\"\",\"state\":\"\",\"error\":\"\"}'\n",
        );

        let mut bus = bus_for(dir.path(), "kcrypt-discovery");
        let err = bus
            .publish_expecting_data(EVENT_DISCOVERY_PASSWORD, &DiscoveryPayload::default())
            .unwrap_err();
        assert!(matches!(err, BusError::NoResponse(_)));
    }

    #[test]
    fn broken_provider_does_not_mask_a_working_one() {
        let dir = tempdir().unwrap();
        write_executable(&dir.path().join("kcrypt-discovery-a-broken"), "#!/bin/sh\nexit 1\n");
        write_executable(
            &dir.path().join("kcrypt-discovery-b-good"),
            "#!/bin/sh\ncat > /dev/null\nprintf '{\"data\":\"pw\",\"state\":\"\",\"error\":\"\"}'\n",
        );

        let mut bus = bus_for(dir.path(), "kcrypt-discovery");
        let data = bus
            .publish_expecting_data(EVENT_DISCOVERY_PASSWORD, &DiscoveryPayload::default())
            .unwrap();
        assert_eq!(data, "pw");
    }

    #[test]
    fn reload_rebuilds_the_provider_set() {
        let dir = tempdir().unwrap();
        let mut bus = bus_for(dir.path(), "kcrypt-discovery");
        bus.initialize();
        assert!(bus.providers().is_empty());

        // initialize() is sticky: no rescan.
        write_executable(
            &dir.path().join("kcrypt-discovery-late"),
            "#!/bin/sh\ncat > /dev/null\nprintf '{\"data\":\"pw\",\"state\":\"\",\"error\":\"\"}'\n",
        );
        bus.initialize();
        assert!(bus.providers().is_empty());

        bus.reload();
        assert_eq!(bus.providers().len(), 1);
    }

    #[test]
    fn providers_receive_the_event_envelope() {
        let dir = tempdir().unwrap();
        let capture = dir.path().join("captured.json");
        write_executable(
            &dir.path().join("kcrypt-discovery-capture"),
            &format!(
                "#!/bin/sh\ncat > {}\nprintf '{{\"data\":\"ok\",\"state\":\"\",\"error\":\"\"}}'\n",
                capture.display()
            ),
        );

        let mut bus = bus_for(dir.path(), "kcrypt-discovery");
        let payload = DiscoveryPayload {
            challenger_server: "https://kms.example".to_string(),
            ..DiscoveryPayload::default()
        };
        bus.publish_expecting_data(EVENT_DISCOVERY_PASSWORD, &payload)
            .unwrap();

        let envelope: EventEnvelope =
            serde_json::from_str(&fs::read_to_string(&capture).unwrap()).unwrap();
        assert_eq!(envelope.name, EVENT_DISCOVERY_PASSWORD);
        let inner: DiscoveryPayload = serde_json::from_str(&envelope.data).unwrap();
        assert_eq!(inner.challenger_server, "https://kms.example");
    }
}
