// Beacon watcher library modules

pub mod config;
pub mod daemon_loop;
pub mod error;
pub mod ledger;
pub mod scan;
pub mod stable;
pub mod startup;
pub mod trigger;
pub mod upload;

// Re-export commonly used types
pub use config::WatcherConfig;
pub use daemon_loop::{run_watch_loop, PassReport, Watcher};
pub use error::WatchError;
pub use ledger::Ledger;
pub use upload::{BeaconUploader, HttpUploader};
