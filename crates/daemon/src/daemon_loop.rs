use anyhow::{Context, Result};
use regex::Regex;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::WatcherConfig;
use crate::error::WatchError;
use crate::ledger::Ledger;
use crate::scan::{scan_beacons, BeaconFile};
use crate::stable::check_settled;
use crate::trigger::Trigger;
use crate::upload::{BeaconUploader, HttpUploader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Uploading,
}

/// Counters for a single scan-filter-upload-record pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassReport {
    pub scanned: usize,
    pub already_processed: usize,
    pub unsettled: usize,
    pub uploaded: usize,
    pub failed: usize,
}

enum BeaconOutcome {
    Uploaded,
    Unsettled,
}

/// Owns the ledger and uploader and drives passes over the watched directory
pub struct Watcher<U> {
    config: WatcherConfig,
    pattern: Regex,
    ledger: Ledger,
    uploader: U,
    state: LoopState,
}

impl<U> std::fmt::Debug for Watcher<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watcher")
            .field("watch_path", &self.config.watch_path)
            .field("ledger", &self.ledger.path())
            .field("state", &self.state)
            .finish()
    }
}

impl<U: BeaconUploader> Watcher<U> {
    pub fn new(config: WatcherConfig, ledger: Ledger, uploader: U) -> Result<Self, WatchError> {
        let pattern = Regex::new(&config.beacon_pattern)
            .map_err(|e| WatchError::Config(format!("bad beacon_pattern: {}", e)))?;

        Ok(Self {
            config,
            pattern,
            ledger,
            uploader,
            state: LoopState::Idle,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn enter(&mut self, state: LoopState) {
        if self.state != state {
            debug!("Watcher {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    /// Run one pass. Per-file and scan errors are logged, never returned.
    pub async fn run_pass(&mut self) -> PassReport {
        let mut report = PassReport::default();

        let beacons = match scan_beacons(&self.config.watch_path, &self.pattern) {
            Ok(beacons) => beacons,
            Err(e) => {
                warn!("Skipping pass: {}", e);
                return report;
            }
        };
        report.scanned = beacons.len();

        for beacon in beacons {
            if self.ledger.contains(&beacon.name) {
                report.already_processed += 1;
                continue;
            }

            match self.process_beacon(&beacon).await {
                Ok(BeaconOutcome::Uploaded) => report.uploaded += 1,
                Ok(BeaconOutcome::Unsettled) => report.unsettled += 1,
                Err(e) => {
                    report.failed += 1;
                    error!("Failed to process {}: {}", beacon.name, e);
                    if let WatchError::Http { body, .. } = &e {
                        debug!("Server response body: {}", body);
                    }
                }
            }
        }

        report
    }

    async fn process_beacon(&mut self, beacon: &BeaconFile) -> Result<BeaconOutcome, WatchError> {
        let settle = Duration::from_secs(self.config.settle_secs);
        if !check_settled(beacon, settle)? {
            debug!("Beacon {} is still being written, deferring", beacon.name);
            return Ok(BeaconOutcome::Unsettled);
        }

        info!("Uploading beacon {}", beacon.name);
        let body = tokio::fs::read(&beacon.path)
            .await
            .map_err(|source| WatchError::Io {
                path: beacon.path.clone(),
                source,
            })?;

        let receipt = self.uploader.upload(beacon, body).await?;
        self.ledger.record(&beacon.name)?;

        info!("Processed {} (HTTP {})", beacon.name, receipt.status);
        Ok(BeaconOutcome::Uploaded)
    }

    /// Run passes until `shutdown` resolves: once immediately, then on every trigger.
    ///
    /// A pass in flight when shutdown arrives is abandoned; whatever it had not
    /// recorded yet is picked up again on the next start.
    pub async fn run<F>(mut self, mut trigger: Trigger, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut reason = None;

        loop {
            if let Some(reason) = reason {
                debug!("Pass triggered by {:?}", reason);
            }

            self.enter(LoopState::Uploading);
            tokio::select! {
                report = self.run_pass() => {
                    log_report(&report);
                }
                _ = &mut shutdown => {
                    warn!("Shutdown requested during a pass, abandoning in-flight upload");
                    break;
                }
            }

            self.enter(LoopState::Idle);
            tokio::select! {
                next = trigger.next() => {
                    reason = Some(next);
                }
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break;
                }
            }
        }

        self.enter(LoopState::Idle);
        info!("Watch loop stopped ({} beacons recorded)", self.ledger.len());
        Ok(())
    }
}

fn log_report(report: &PassReport) {
    if report.uploaded > 0 || report.failed > 0 {
        info!(
            "Pass complete: {} uploaded, {} failed, {} deferred, {} already processed",
            report.uploaded, report.failed, report.unsettled, report.already_processed
        );
    } else {
        debug!(
            "Pass complete: nothing new ({} scanned, {} deferred)",
            report.scanned, report.unsettled
        );
    }
}

/// Build the ledger, uploader and trigger from `config` and watch until `shutdown`
pub async fn run_watch_loop<F>(config: WatcherConfig, shutdown: F) -> Result<()>
where
    F: Future<Output = ()>,
{
    info!("Starting watch loop");
    info!("Scan interval: {} seconds", config.scan_interval_secs);

    let ledger_path = config.ledger_file();
    let ledger = Ledger::load(&ledger_path)
        .with_context(|| format!("Failed to load ledger {}", ledger_path.display()))?;
    info!(
        "Ledger {} holds {} processed beacons",
        ledger.path().display(),
        ledger.len()
    );

    let uploader = HttpUploader::new(&config).context("Failed to set up uploader")?;
    info!("Uploading to {} ({:?})", uploader.url(), uploader.encoding());

    let period = Duration::from_secs(config.scan_interval_secs);
    let trigger = if config.watch_events {
        Trigger::with_fs_events(&config.watch_path, period)
    } else {
        Trigger::polling(period)
    };

    info!("Watching directory {}", config.watch_path.display());

    let watcher = Watcher::new(config, ledger, uploader)?;
    watcher.run(trigger, shutdown).await
}
