use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, sleep, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Quiet period used to fold a burst of filesystem events into one pass
const EVENT_DEBOUNCE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerReason {
    Interval,
    FsEvent,
}

/// Source of "time to run a pass" signals.
///
/// Polling is always on. When filesystem events are enabled they fire passes
/// early and push the next poll back by a full interval.
pub struct Trigger {
    interval: Interval,
    events: Option<mpsc::UnboundedReceiver<()>>,
    _watcher: Option<RecommendedWatcher>,
}

impl std::fmt::Debug for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trigger")
            .field("period", &self.interval.period())
            .field("fs_events", &self.events.is_some())
            .finish()
    }
}

impl Trigger {
    pub fn polling(period: Duration) -> Self {
        // The caller runs an initial pass itself, so the first tick is one period out
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            interval,
            events: None,
            _watcher: None,
        }
    }

    /// Poll every `period` and also wake on new files in `dir`.
    ///
    /// Falls back to polling alone when the OS watcher cannot be set up.
    pub fn with_fs_events(dir: &Path, period: Duration) -> Self {
        let mut trigger = Self::polling(period);

        match spawn_watcher(dir) {
            Ok((watcher, rx)) => {
                info!("Watching {} for filesystem events", dir.display());
                trigger.events = Some(rx);
                trigger._watcher = Some(watcher);
            }
            Err(e) => {
                warn!(
                    "Filesystem events unavailable for {} ({}), polling only",
                    dir.display(),
                    e
                );
            }
        }

        trigger
    }

    pub fn has_fs_events(&self) -> bool {
        self.events.is_some()
    }

    /// Wait for the next reason to run a pass
    pub async fn next(&mut self) -> TriggerReason {
        loop {
            let fired = tokio::select! {
                _ = self.interval.tick() => Some(TriggerReason::Interval),
                event = recv_event(&mut self.events) => event.map(|()| TriggerReason::FsEvent),
            };

            match fired {
                Some(TriggerReason::FsEvent) => {
                    self.coalesce_events().await;
                    self.interval.reset();
                    return TriggerReason::FsEvent;
                }
                Some(reason) => return reason,
                None => {
                    warn!("Filesystem watcher stopped, polling only");
                    self.events = None;
                    self._watcher = None;
                }
            }
        }
    }

    async fn coalesce_events(&mut self) {
        sleep(EVENT_DEBOUNCE).await;
        if let Some(rx) = self.events.as_mut() {
            let mut dropped = 0usize;
            while rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                debug!("Coalesced {} extra filesystem events", dropped);
            }
        }
    }
}

async fn recv_event(events: &mut Option<mpsc::UnboundedReceiver<()>>) -> Option<()> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn spawn_watcher(
    dir: &Path,
) -> notify::Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if is_relevant(&event) {
                debug!("Filesystem event: {:?} {:?}", event.kind, event.paths);
                let _ = tx.send(());
            }
        }
        Err(e) => error!("Watch error: {:?}", e),
    })?;

    watcher.watch(dir, RecursiveMode::NonRecursive)?;
    Ok((watcher, rx))
}

/// New or changed visible files; the ledger and other dotfiles are ignored
fn is_relevant(event: &Event) -> bool {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return false;
    }

    event.paths.iter().any(|path| {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| !name.starts_with('.'))
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::path::PathBuf;

    #[test]
    fn test_relevant_events() {
        let create = Event::new(EventKind::Create(CreateKind::File))
            .add_path(PathBuf::from("/beacons/beacon_001.dat"));
        assert!(is_relevant(&create));

        let modify = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/beacons/beacon_001.dat"));
        assert!(is_relevant(&modify));

        let ledger = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/beacons/.processed_beacons"));
        assert!(!is_relevant(&ledger));

        let remove = Event::new(EventKind::Remove(RemoveKind::File))
            .add_path(PathBuf::from("/beacons/beacon_001.dat"));
        assert!(!is_relevant(&remove));
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_fires_after_one_period() {
        let mut trigger = Trigger::polling(Duration::from_secs(30));
        assert!(!trigger.has_fs_events());

        let start = Instant::now();
        assert_eq!(trigger.next().await, TriggerReason::Interval);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fs_event_fires_early() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut trigger = Trigger::with_fs_events(dir.path(), Duration::from_secs(3600));
        if !trigger.has_fs_events() {
            // No inotify/kqueue in this sandbox
            return;
        }

        std::fs::write(dir.path().join("beacon_001.dat"), b"data").unwrap();

        let reason = tokio::time::timeout(Duration::from_secs(10), trigger.next())
            .await
            .expect("fs event should fire before the poll interval");
        assert_eq!(reason, TriggerReason::FsEvent);
    }
}
