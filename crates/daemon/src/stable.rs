use crate::error::WatchError;
use crate::scan::BeaconFile;
use std::fs;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Check whether a beacon has stopped changing and can be uploaded.
///
/// The file is re-read from disk and compared against what the scan saw. It
/// counts as settled when its size is unchanged and its mtime is at least
/// `settle` old. A zero `settle` only checks the size.
///
/// # Returns
/// * `Ok(true)` if the beacon is ready to upload
/// * `Ok(false)` if it is still being written and should wait for a later pass
/// * `Err` if the file could not be read (e.g. it was removed)
pub fn check_settled(file: &BeaconFile, settle: Duration) -> Result<bool, WatchError> {
    let metadata = fs::metadata(&file.path).map_err(|source| WatchError::Io {
        path: file.path.clone(),
        source,
    })?;

    let current_size = metadata.len();
    if current_size != file.size_bytes {
        debug!(
            "Beacon {} is still growing (size changed from {} to {} bytes)",
            file.name, file.size_bytes, current_size
        );
        return Ok(false);
    }

    let modified = metadata.modified().unwrap_or(file.modified_time);
    Ok(is_old_enough(modified, SystemTime::now(), settle))
}

/// True when `modified` lies at least `settle` before `now`
pub fn is_old_enough(modified: SystemTime, now: SystemTime, settle: Duration) -> bool {
    if settle.is_zero() {
        return true;
    }

    match now.duration_since(modified) {
        Ok(age) => age >= settle,
        // mtime ahead of the local clock: skewed writer, waiting will not help
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_settle_always_passes() {
        let now = SystemTime::now();
        assert!(is_old_enough(now, now, Duration::ZERO));
    }

    #[test]
    fn test_young_file_is_not_settled() {
        let now = SystemTime::now();
        let modified = now - Duration::from_millis(500);
        assert!(!is_old_enough(modified, now, Duration::from_secs(2)));
        assert!(is_old_enough(modified, now, Duration::from_millis(500)));
    }

    #[test]
    fn test_growing_file_is_not_settled() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("beacon_001.dat");
        fs::write(&path, b"partial").unwrap();

        let metadata = fs::metadata(&path).unwrap();
        let beacon = BeaconFile {
            name: "beacon_001.dat".to_string(),
            path: path.clone(),
            size_bytes: metadata.len(),
            modified_time: metadata.modified().unwrap(),
        };
        assert!(check_settled(&beacon, Duration::ZERO).unwrap());

        fs::write(&path, b"partial plus the rest").unwrap();
        assert!(!check_settled(&beacon, Duration::ZERO).unwrap());

        fs::remove_file(&path).unwrap();
        assert!(check_settled(&beacon, Duration::ZERO).is_err());
    }

    #[test]
    fn test_future_mtime_counts_as_settled() {
        let now = SystemTime::now();
        let modified = now + Duration::from_secs(3600);
        assert!(is_old_enough(modified, now, Duration::from_secs(2)));
    }
}
