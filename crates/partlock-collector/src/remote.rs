//! Remote `config_url` fetching.
//!
//! Failures here must never break a boot: a document that cannot be fetched
//! or carries no recognised header degrades to an empty config.

use crate::{has_valid_header, Config, CollectorError, CollectorResult};
use log::warn;
use serde_yaml::Mapping;
use std::thread;
use std::time::Duration;

const FETCH_ATTEMPTS: u32 = 3;
const FETCH_DELAY: Duration = Duration::from_secs(1);

/// Fetch and parse a remote config document.
pub(crate) fn fetch_remote_config(url: &str) -> CollectorResult<Config> {
    let body = match fetch_with_retries(url) {
        Ok(body) => body,
        Err(err) => {
            warn!("fetching remote config {url}: {err}");
            return Ok(Config::default());
        }
    };

    if !has_valid_header(&body) {
        warn!("remote config {url} has no valid header, ignoring");
        return Ok(Config::default());
    }

    let values = serde_yaml::from_str::<Mapping>(&body).map_err(CollectorError::Parse)?;
    Ok(Config::from_values(values, url))
}

fn fetch_with_retries(url: &str) -> Result<String, String> {
    let client = reqwest::blocking::Client::new();
    let mut last_err = String::new();

    for attempt in 0..FETCH_ATTEMPTS {
        if attempt > 0 {
            thread::sleep(FETCH_DELAY);
        }
        match client.get(url).send() {
            Ok(response) => {
                if !response.status().is_success() {
                    last_err = format!("unexpected status: {}", response.status().as_u16());
                    continue;
                }
                match response.text() {
                    Ok(body) => return Ok(body),
                    Err(err) => last_err = err.to_string(),
                }
            }
            Err(err) => last_err = err.to_string(),
        }
    }

    Err(last_err)
}
