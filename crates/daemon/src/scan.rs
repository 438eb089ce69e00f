use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::WatchError;
use crate::ledger::check_entry;

/// Filename layout the Capsat ground station writes beacons with
const BEACON_TIMESTAMP_FORMAT: &str = "beacon_%Y-%m-%d_%H:%M:%S";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BeaconFile {
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub modified_time: SystemTime,
}

impl BeaconFile {
    /// Capture time encoded in the filename, if it follows the device convention
    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        parse_beacon_timestamp(&self.name)
    }
}

/// List beacon files directly inside `dir`, sorted by name
pub fn scan_beacons(dir: &Path, pattern: &Regex) -> Result<Vec<BeaconFile>, WatchError> {
    debug!("Scanning watch path: {}", dir.display());

    let metadata = fs::metadata(dir).map_err(|source| WatchError::Path {
        path: dir.to_path_buf(),
        source,
    })?;

    if !metadata.is_dir() {
        return Err(WatchError::Path {
            path: dir.to_path_buf(),
            source: io::Error::other("not a directory"),
        });
    }

    // Surface permission problems as a path error rather than an empty listing
    fs::read_dir(dir).map_err(|source| WatchError::Path {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut beacons = Vec::new();

    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Error accessing directory entry: {}", e);
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        let name = match entry.file_name().to_str() {
            Some(name) => name.to_string(),
            None => {
                debug!("Skipping non UTF-8 filename: {:?}", entry.file_name());
                continue;
            }
        };

        if !is_beacon_name(&name, pattern) {
            if !name.starts_with('.') && pattern.is_match(&name) {
                warn!("Ignoring beacon {:?}: name cannot be recorded as processed", name);
            }
            continue;
        }

        // The file may have been removed since it was listed
        match entry.metadata() {
            Ok(metadata) => beacons.push(BeaconFile {
                name,
                path: entry.path().to_path_buf(),
                size_bytes: metadata.len(),
                modified_time: metadata.modified().unwrap_or_else(|_| SystemTime::now()),
            }),
            Err(e) => {
                warn!("Failed to get metadata for {}: {}", entry.path().display(), e);
                continue;
            }
        }
    }

    beacons.sort_by(|a, b| a.name.cmp(&b.name));
    debug!("Found {} beacon files", beacons.len());
    Ok(beacons)
}

/// Hidden files never count, whatever the pattern says. Names the ledger
/// cannot store as a single line are excluded too.
pub fn is_beacon_name(name: &str, pattern: &Regex) -> bool {
    !name.starts_with('.') && check_entry(name).is_ok() && pattern.is_match(name)
}

pub fn parse_beacon_timestamp(name: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(name, BEACON_TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_device_timestamp() {
        let ts = parse_beacon_timestamp("beacon_2021-10-19_13:45:07").unwrap();
        assert_eq!(ts.year(), 2021);
        assert_eq!(ts.month(), 10);
        assert_eq!(ts.day(), 19);
        assert_eq!(ts.hour(), 13);
        assert_eq!(ts.minute(), 45);
        assert_eq!(ts.second(), 7);
    }

    #[test]
    fn test_unparseable_timestamp_is_none() {
        assert!(parse_beacon_timestamp("beacon_001.dat").is_none());
        assert!(parse_beacon_timestamp("beacon_2021-13-40_99:00:00").is_none());
    }

    #[test]
    fn test_hidden_files_never_match() {
        let pattern = Regex::new(".*").unwrap();
        assert!(!is_beacon_name(".processed_beacons", &pattern));
        assert!(is_beacon_name("beacon_001.dat", &pattern));
    }

    #[test]
    fn test_unrecordable_names_never_match() {
        let pattern = Regex::new("^beacon_").unwrap();
        for name in ["beacon_001.dat ", "beacon_\\001", "beacon_\t001", "beacon_001\r"] {
            assert!(!is_beacon_name(name, &pattern), "{:?} should not match", name);
        }
    }
}
