use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while scanning, uploading or recording beacons.
///
/// Everything except `Config` is recoverable: the watch loop logs it and
/// moves on to the next file or the next pass.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch path {path} is not accessible: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("upload request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("server rejected upload with HTTP {status}")]
    Http { status: u16, body: String },

    #[error("ledger {path}: {message}")]
    Ledger { path: PathBuf, message: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}
