use anyhow::Result;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the ledger file kept in the watched directory by default
pub const DEFAULT_LEDGER_FILE: &str = ".processed_beacons";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub token: String,
    pub watch_path: PathBuf,
    pub target_base_url: String,
    pub ledger_path: Option<PathBuf>,
    pub beacon_pattern: String,
    pub upload_path: String,
    pub encoding: UploadEncoding,
    pub scan_interval_secs: u64,
    pub settle_secs: u64,
    pub request_timeout_secs: u64,
    pub watch_events: bool,
    pub error_dump_path: Option<PathBuf>,
    pub expected_sources: Vec<String>,
}

/// How a beacon is packed into the POST body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadEncoding {
    Multipart,
    Raw,
}

impl std::str::FromStr for UploadEncoding {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "multipart" => Ok(UploadEncoding::Multipart),
            "raw" => Ok(UploadEncoding::Raw),
            other => Err(format!("unknown encoding '{}' (expected multipart or raw)", other)),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            watch_path: PathBuf::from("."),
            target_base_url: String::new(),
            ledger_path: None,
            beacon_pattern: "^beacon_".to_string(),
            upload_path: "/api/objects/beacons/".to_string(),
            encoding: UploadEncoding::Multipart,
            scan_interval_secs: 30,
            settle_secs: 2,
            request_timeout_secs: 30,
            watch_events: true,
            error_dump_path: None,
            expected_sources: Vec::new(),
        }
    }
}

impl WatcherConfig {
    /// Where processed filenames are persisted
    pub fn ledger_file(&self) -> PathBuf {
        self.ledger_path
            .clone()
            .unwrap_or_else(|| self.watch_path.join(DEFAULT_LEDGER_FILE))
    }

    /// Full URL uploads are posted to
    pub fn upload_url(&self) -> Result<Url> {
        join_url(&self.target_base_url, &self.upload_path)
    }
}

/// Values supplied on the command line. `None` leaves the file/default value alone.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub token: Option<String>,
    pub watch_path: Option<PathBuf>,
    pub target_base_url: Option<String>,
    pub ledger_path: Option<PathBuf>,
    pub upload_path: Option<String>,
    pub encoding: Option<UploadEncoding>,
    pub scan_interval_secs: Option<u64>,
    pub watch_events: Option<bool>,
    pub error_dump_path: Option<PathBuf>,
    pub expected_sources: Option<Vec<String>>,
}

impl ConfigOverrides {
    pub fn apply(self, config: &mut WatcherConfig) {
        if let Some(token) = self.token {
            config.token = token;
        }
        if let Some(path) = self.watch_path {
            config.watch_path = path;
        }
        if let Some(target) = self.target_base_url {
            config.target_base_url = target;
        }
        if let Some(ledger) = self.ledger_path {
            config.ledger_path = Some(ledger);
        }
        if let Some(upload_path) = self.upload_path {
            config.upload_path = upload_path;
        }
        if let Some(encoding) = self.encoding {
            config.encoding = encoding;
        }
        if let Some(secs) = self.scan_interval_secs {
            config.scan_interval_secs = secs;
        }
        if let Some(watch_events) = self.watch_events {
            config.watch_events = watch_events;
        }
        if let Some(dump) = self.error_dump_path {
            config.error_dump_path = Some(dump);
        }
        if let Some(sources) = self.expected_sources {
            config.expected_sources = sources;
        }
    }
}

/// Load the TOML config (if any), layer the CLI overrides on top and validate.
pub fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> Result<WatcherConfig> {
    let mut config = if let Some(config_path) = path {
        if config_path.exists() {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| anyhow::anyhow!("Failed to read config file: {}", e))?;

            toml::from_str::<WatcherConfig>(&contents)
                .map_err(|e| anyhow::anyhow!("Failed to parse TOML config: {}", e))?
        } else {
            #[cfg(not(test))]
            tracing::warn!("Config file not found at {:?}, using defaults", config_path);
            WatcherConfig::default()
        }
    } else {
        WatcherConfig::default()
    };

    overrides.apply(&mut config);
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &WatcherConfig) -> Result<()> {
    if config.token.trim().is_empty() {
        anyhow::bail!("token cannot be empty");
    }

    if config.target_base_url.trim().is_empty() {
        anyhow::bail!("target_base_url cannot be empty");
    }

    let target = Url::parse(&config.target_base_url)
        .map_err(|e| anyhow::anyhow!("target_base_url is not a valid URL: {}", e))?;
    if target.scheme() != "http" && target.scheme() != "https" {
        anyhow::bail!("target_base_url must use http or https, got {}", target.scheme());
    }
    if target.cannot_be_a_base() || target.host_str().is_none() {
        anyhow::bail!("target_base_url must include a host");
    }

    config.upload_url()?;

    if config.watch_path.as_os_str().is_empty() {
        anyhow::bail!("watch_path cannot be empty");
    }

    Regex::new(&config.beacon_pattern)
        .map_err(|e| anyhow::anyhow!("beacon_pattern is not a valid regex: {}", e))?;

    if config.scan_interval_secs == 0 {
        anyhow::bail!("scan_interval_secs must be at least 1");
    }

    if config.request_timeout_secs == 0 {
        anyhow::bail!("request_timeout_secs must be at least 1");
    }

    Ok(())
}

/// Join the target prefix and upload path with exactly one `/` between them.
pub fn join_url(base: &str, path: &str) -> Result<Url> {
    let joined = format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Url::parse(&joined).map_err(|e| anyhow::anyhow!("Invalid upload URL {}: {}", joined, e))
}
