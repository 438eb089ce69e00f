use crate::config::{join_url, WatcherConfig};
use crate::upload::authorization_value;
use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Server endpoint listing the record sources beacons are filed under
pub const RECORD_SOURCES_PATH: &str = "/api/objects/record_sources/";

#[derive(Debug, Deserialize)]
struct RecordSourcePage {
    results: Vec<RecordSource>,
}

#[derive(Debug, Deserialize)]
struct RecordSource {
    suffix: String,
}

/// The watched directory must exist and be listable before the loop starts
pub fn check_watch_path(path: &Path) -> Result<()> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Watch path {} is not accessible", path.display()))?;

    if !metadata.is_dir() {
        return Err(anyhow!("Watch path {} is not a directory", path.display()));
    }

    fs::read_dir(path)
        .with_context(|| format!("Watch path {} is not readable", path.display()))?;

    Ok(())
}

/// Resolve the ledger location and make sure its parent directory exists
pub fn resolve_ledger_path(config: &WatcherConfig) -> Result<PathBuf> {
    let path = config.ledger_file();

    if path.is_dir() {
        return Err(anyhow!("Ledger path {} is a directory", path.display()));
    }

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create ledger directory {}", parent.display()))?;
    }

    Ok(path)
}

/// Ask the target which record sources it knows about.
///
/// Confirms the server is reachable and the token is accepted before any
/// beacon is touched. Every name in `expected_sources` must be among the
/// server's sources, otherwise the missing ones are reported as an error.
pub async fn preflight(config: &WatcherConfig) -> Result<Vec<String>> {
    let url = join_url(&config.target_base_url, RECORD_SOURCES_PATH)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .context("Failed to build HTTP client")?;

    let response = client
        .get(url.clone())
        .header(reqwest::header::AUTHORIZATION, authorization_value(&config.token))
        .send()
        .await
        .with_context(|| format!("Failed to reach {}", url))?;

    let status = response.status();
    if !status.is_success() {
        return Err(anyhow!("Preflight against {} failed with HTTP {}", url, status));
    }

    let body = response
        .bytes()
        .await
        .context("Failed to read preflight response")?;

    let sources = parse_record_sources(&body)?;

    let missing = missing_sources(&config.expected_sources, &sources);
    if !missing.is_empty() {
        bail!(
            "Target {} is missing record sources: {}",
            config.target_base_url,
            missing.join(", ")
        );
    }

    Ok(sources)
}

/// Expected names absent from `available`, in the order they were expected
fn missing_sources(expected: &[String], available: &[String]) -> Vec<String> {
    expected
        .iter()
        .filter(|name| !available.contains(name))
        .cloned()
        .collect()
}

fn parse_record_sources(body: &[u8]) -> Result<Vec<String>> {
    let page: RecordSourcePage =
        serde_json::from_slice(body).context("Failed to parse record sources response")?;
    Ok(page.results.into_iter().map(|rs| rs.suffix).collect())
}
