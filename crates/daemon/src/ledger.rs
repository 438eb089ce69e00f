use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::WatchError;

/// Persisted set of beacon filenames that were uploaded successfully.
///
/// The backing file holds one filename per line, newline terminated, and is
/// only ever appended to. Only one process may write a given ledger file at a
/// time; this is not enforced.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    entries: BTreeSet<String>,
    // Set when the file on disk does not end in '\n' (torn write)
    needs_newline: bool,
}

impl Ledger {
    /// Load the ledger at `path`. A missing file is an empty ledger.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, WatchError> {
        let path = path.into();

        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No ledger at {}, starting empty", path.display());
                return Ok(Self {
                    path,
                    entries: BTreeSet::new(),
                    needs_newline: false,
                });
            }
            Err(source) => return Err(WatchError::Io { path, source }),
        };

        let needs_newline = bytes.last().is_some_and(|b| *b != b'\n');
        let mut entries = BTreeSet::new();

        for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.is_empty() {
                continue;
            }

            let line = match std::str::from_utf8(raw) {
                Ok(line) => line,
                Err(_) => {
                    warn!("Skipping non UTF-8 line {} in ledger {}", idx + 1, path.display());
                    continue;
                }
            };

            match check_entry(line) {
                Ok(()) => {
                    entries.insert(line.to_string());
                }
                Err(reason) => {
                    warn!(
                        "Skipping malformed line {} in ledger {}: {}",
                        idx + 1,
                        path.display(),
                        reason
                    );
                }
            }
        }

        debug!("Loaded {} entries from ledger {}", entries.len(), path.display());

        Ok(Self {
            path,
            entries,
            needs_newline,
        })
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.entries.contains(filename)
    }

    /// Durably record `filename`.
    ///
    /// Returns `Ok(false)` without touching the file when the name is already
    /// present. The line is synced to disk before `Ok(true)` is returned.
    pub fn record(&mut self, filename: &str) -> Result<bool, WatchError> {
        if self.entries.contains(filename) {
            return Ok(false);
        }

        check_entry(filename).map_err(|reason| WatchError::Ledger {
            path: self.path.clone(),
            message: format!("cannot record {:?}: {}", filename, reason),
        })?;

        let mut line = String::with_capacity(filename.len() + 2);
        if self.needs_newline {
            line.push('\n');
        }
        line.push_str(filename);
        line.push('\n');

        self.append(line.as_bytes())
            .map_err(|source| WatchError::Io {
                path: self.path.clone(),
                source,
            })?;

        self.needs_newline = false;
        self.entries.insert(filename.to_string());
        Ok(true)
    }

    fn append(&self, bytes: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(bytes)?;
        file.flush()?;
        file.sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

/// A ledger entry must survive a write/read cycle as exactly one line
pub fn check_entry(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty filename");
    }
    if name.trim() != name {
        return Err("leading or trailing whitespace");
    }
    if name.chars().any(char::is_control) {
        return Err("control character");
    }
    if name.contains('/') || name.contains('\\') {
        return Err("path separator");
    }
    Ok(())
}
