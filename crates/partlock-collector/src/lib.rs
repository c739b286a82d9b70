#![forbid(unsafe_code)]

//! Configuration collector.
//!
//! Merges cloud-config style YAML files from a list of directories with the
//! kernel command line into a single dynamic tree, following `config_url`
//! indirections along the way. Plain-array documents are rejected: there is
//! nothing to merge an array document into.

mod cmdline;
mod merge;
mod remote;

use log::warn;
use serde_yaml::{Mapping, Value};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

pub use cmdline::{parse_cmdline, parse_cmdline_str};
pub use merge::deep_merge;

/// Directories scanned when the caller does not supply any.
pub const DEFAULT_SCAN_DIRS: &[&str] = &["/oem", "/sysroot/oem", "/run/cos/oem"];

/// Header written when rendering a merged config back to YAML.
pub const DEFAULT_HEADER: &str = "#cloud-config";

/// Headers accepted on config documents.
pub const VALID_FILE_HEADERS: &[&str] = &["#cloud-config", "#kairos-config", "#node-config"];

const MAX_FILE_SIZE: u64 = 1024 * 1024;
const HEADER_SCAN_LINES: usize = 10;

/// Errors produced while collecting or merging configuration.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// Two sources disagree on the kind of a value.
    #[error("cannot merge {left} with {right}")]
    MergeKind {
        left: &'static str,
        right: &'static str,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type CollectorResult<T> = Result<T, CollectorError>;

/// Scan behaviour knobs.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directories scanned (non-recursively) for config documents.
    pub scan_dirs: Vec<PathBuf>,
    /// Merge `key=value` pairs from the boot command line.
    pub merge_boot_cmdline: bool,
    /// Command-line file, normally `/proc/cmdline`.
    pub boot_cmdline_file: PathBuf,
    /// Follow `config_url` keys found in sources.
    pub follow_config_url: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            scan_dirs: DEFAULT_SCAN_DIRS.iter().map(PathBuf::from).collect(),
            merge_boot_cmdline: true,
            boot_cmdline_file: PathBuf::from("/proc/cmdline"),
            follow_config_url: true,
        }
    }
}

/// One configuration document plus where it came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    pub sources: Vec<String>,
    pub values: Mapping,
}

impl Config {
    /// Wrap an already-parsed mapping.
    pub fn from_values(values: Mapping, source: impl Into<String>) -> Self {
        Self {
            sources: vec![source.into()],
            values,
        }
    }

    /// The `config_url` value when present and a string.
    pub fn config_url(&self) -> Option<String> {
        self.values
            .get(Value::from("config_url"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Merge `other` into `self`; values from `other` win on conflicts.
    pub fn merge(&mut self, other: Config) -> CollectorResult<()> {
        let merged = deep_merge(
            Value::Mapping(std::mem::take(&mut self.values)),
            Value::Mapping(other.values),
        )?;
        let Value::Mapping(values) = merged else {
            unreachable!("merging two mappings always yields a mapping");
        };
        self.values = values;
        self.sources.extend(other.sources);
        Ok(())
    }

    /// Follow `config_url` recursively, merging every remote document in.
    /// Fetch failures degrade to the in-hand values.
    pub fn merge_config_url(&mut self) -> CollectorResult<()> {
        let Some(url) = self.config_url() else {
            return Ok(());
        };
        let mut remote = remote::fetch_remote_config(&url)?;
        remote.merge_config_url()?;
        self.merge(remote)
    }

    /// Render the merged tree as a cloud-config document with a sources
    /// comment block.
    pub fn to_yaml_string(&self) -> CollectorResult<String> {
        let mut sources_comment = String::new();
        if !self.sources.is_empty() {
            sources_comment.push_str("# Sources:\n");
            for source in &self.sources {
                let _ = writeln!(sources_comment, "# - {source}");
            }
            sources_comment.push('\n');
        }
        let body = serde_yaml::to_string(&self.values)?;
        Ok(format!("{DEFAULT_HEADER}\n\n{sources_comment}{body}"))
    }
}

/// Collect and merge every configured source, in order: directory files
/// first, then the boot command line, then remote indirections.
pub fn scan(options: &Options) -> CollectorResult<Config> {
    let mut configs = parse_files(&options.scan_dirs);

    if options.merge_boot_cmdline {
        match parse_cmdline(&options.boot_cmdline_file) {
            Ok(config) => configs.push(config),
            // Best effort: a host without a readable cmdline still gets its
            // file-based config.
            Err(err) => warn!("parsing cmdline: {err}"),
        }
    }

    let mut result = Config::default();
    for mut config in configs {
        if options.follow_config_url {
            config.merge_config_url()?;
        }
        result.merge(config)?;
    }
    Ok(result)
}

/// Parse eligible YAML documents from `dirs`, skipping anything oversize,
/// unparseable, or missing a recognised header.
fn parse_files(dirs: &[PathBuf]) -> Vec<Config> {
    let mut result = Vec::new();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(dir) else {
            continue;
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .collect();
        files.sort();

        for file in files {
            if !has_yaml_extension(&file) {
                warn!("skipping {} (extension)", file.display());
                continue;
            }
            let Ok(meta) = fs::metadata(&file) else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            if meta.len() > MAX_FILE_SIZE {
                warn!("skipping {}: too big (>1MiB)", file.display());
                continue;
            }
            let contents = match fs::read_to_string(&file) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!("skipping {}: {err}", file.display());
                    continue;
                }
            };
            if !has_valid_header(&contents) {
                warn!("skipping {}: no valid header", file.display());
                continue;
            }
            match serde_yaml::from_str::<Mapping>(&contents) {
                Ok(values) => {
                    result.push(Config::from_values(values, file.display().to_string()));
                }
                Err(err) => warn!("failed to parse {}: {err}", file.display()),
            }
        }
    }
    result
}

fn has_yaml_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yml") | Some("yaml")
    )
}

/// Check the first few lines for one of the recognised `#...` headers.
/// Comments and jinja template markers may precede the header.
pub fn has_valid_header(data: &str) -> bool {
    data.lines()
        .take(HEADER_SCAN_LINES)
        .map(|line| line.trim_end())
        .filter(|line| line.starts_with('#'))
        .any(|line| VALID_FILE_HEADERS.contains(&line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(dir: &Path, name: &str, contents: &str) {
        fs::write(dir.join(name), contents).unwrap();
    }

    fn scan_dir(dir: &Path) -> Config {
        let options = Options {
            scan_dirs: vec![dir.to_path_buf()],
            merge_boot_cmdline: false,
            follow_config_url: false,
            ..Options::default()
        };
        scan(&options).unwrap()
    }

    #[test]
    fn header_detection() {
        assert!(has_valid_header("#cloud-config\nfoo: bar\n"));
        assert!(has_valid_header("#kairos-config\n"));
        assert!(has_valid_header("#node-config\n"));
        assert!(has_valid_header(
            "## template: jinja\n#cloud-config\nfoo: 1\n"
        ));
        assert!(!has_valid_header("#cloud-config-extra\nfoo: bar\n"));
        assert!(!has_valid_header("foo: bar\n"));
    }

    #[test]
    fn scan_merges_files_in_order() {
        let dir = tempdir().unwrap();
        write(
            dir.path(),
            "00_base.yaml",
            "#cloud-config\nkcrypt:\n  challenger:\n    challenger_server: one\n",
        );
        write(
            dir.path(),
            "10_override.yaml",
            "#cloud-config\nkcrypt:\n  challenger:\n    challenger_server: two\n    mdns: true\n",
        );

        let config = scan_dir(dir.path());
        let rendered = config.to_yaml_string().unwrap();
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains("challenger_server: two"));
        assert!(rendered.contains("mdns: true"));
        assert_eq!(config.sources.len(), 2);
    }

    #[test]
    fn scan_skips_wrong_extension_header_and_oversize() {
        let dir = tempdir().unwrap();
        write(dir.path(), "config.txt", "#cloud-config\nignored: true\n");
        write(dir.path(), "no_header.yaml", "ignored: true\n");
        let big = format!("#cloud-config\nbig: \"{}\"\n", "x".repeat(2 * 1024 * 1024));
        write(dir.path(), "big.yaml", &big);
        write(dir.path(), "good.yaml", "#node-config\nkept: true\n");

        let config = scan_dir(dir.path());
        assert_eq!(config.sources.len(), 1);
        assert_eq!(
            config.values.get(Value::from("kept")),
            Some(&Value::from(true))
        );
        assert!(!config.values.contains_key(Value::from("ignored")));
        assert!(!config.values.contains_key(Value::from("big")));
    }

    #[test]
    fn missing_directories_are_tolerated() {
        let options = Options {
            scan_dirs: vec![PathBuf::from("/definitely/not/here")],
            merge_boot_cmdline: false,
            follow_config_url: false,
            ..Options::default()
        };
        let config = scan(&options).unwrap();
        assert!(config.values.is_empty());
    }

    #[test]
    fn config_url_accessor() {
        let mut values = Mapping::new();
        values.insert(Value::from("config_url"), Value::from("http://x/c.yaml"));
        let config = Config::from_values(values, "test");
        assert_eq!(config.config_url().as_deref(), Some("http://x/c.yaml"));
    }
}
