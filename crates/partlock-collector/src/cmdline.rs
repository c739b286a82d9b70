//! Kernel command-line parsing.
//!
//! Each whitespace-separated `key=value` token forms a path into the config
//! tree, with dots expanding into nested mappings: `kairos.kcrypt.mdns=true`
//! becomes `{kairos: {kcrypt: {mdns: true}}}`. Values are read as YAML
//! scalars so booleans and numbers keep their natural types. Tokens without
//! `=` (bare flags like `quiet`) carry no config and are ignored.

use crate::merge::deep_merge;
use crate::{Config, CollectorResult};
use serde_yaml::{Mapping, Value};
use std::fs;
use std::path::Path;

/// Parse `file` (normally `/proc/cmdline`) into a config document.
pub fn parse_cmdline(file: &Path) -> CollectorResult<Config> {
    let contents = fs::read_to_string(file)?;
    let values = parse_cmdline_str(&contents)?;
    Ok(Config {
        sources: vec!["cmdline".to_string()],
        values,
    })
}

/// Expand a command line into nested mappings.
pub fn parse_cmdline_str(cmdline: &str) -> CollectorResult<Mapping> {
    let mut result = Value::Mapping(Mapping::new());
    for token in cmdline.split_whitespace() {
        let Some((key, raw_value)) = token.split_once('=') else {
            continue;
        };
        if key.is_empty() || key.split('.').any(str::is_empty) {
            continue;
        }
        let value = scalar_value(raw_value);
        let nested = nest(key.split('.'), value);
        result = deep_merge(result, nested)?;
    }
    let Value::Mapping(values) = result else {
        unreachable!("cmdline expansion only ever merges mappings");
    };
    Ok(values)
}

fn nest<'a>(mut segments: impl Iterator<Item = &'a str>, value: Value) -> Value {
    match segments.next() {
        None => value,
        Some(segment) => {
            let mut mapping = Mapping::new();
            mapping.insert(Value::from(segment), nest(segments, value));
            Value::Mapping(mapping)
        }
    }
}

fn scalar_value(raw: &str) -> Value {
    if raw.is_empty() {
        return Value::from("");
    }
    // TPM NV indexes travel as 0x-prefixed strings; YAML would read them as
    // integers and lose the hex form.
    if raw.starts_with("0x") || raw.starts_with("0X") {
        return Value::from(raw);
    }
    serde_yaml::from_str::<Value>(raw).unwrap_or_else(|_| Value::from(raw))
}
