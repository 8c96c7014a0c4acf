//! Change notification for the engine discovery record.
//!
//! The watcher observes the record's directory with `notify` and falls back
//! to polling the record timestamp when no filesystem watcher is available.
//! Bursts of changes (an engine restarting writes, clears and rewrites the
//! record) collapse into one callback after the debounce delay.

use crate::debounce::{far_future, Debounce};
use crate::error::Result;
use crate::state_store::{EngineState, StateStore};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub debounce: Duration,
    pub poll_interval: Duration,
    /// Skip the filesystem watcher and always poll
    pub force_poll: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(100),
            poll_interval: Duration::from_millis(1000),
            force_poll: false,
        }
    }
}

/// How the watcher ended up observing the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Events,
    Poll,
}

/// Stops the watcher. Stopping twice, or dropping after stop, is a no-op.
#[derive(Debug)]
pub struct WatchHandle {
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    mode: WatchMode,
}

impl WatchHandle {
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            let _ = self.shutdown.send(true);
            log::debug!("[WATCH] Stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> WatchMode {
        self.mode
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fingerprint of what a notification reported; `None` means no record.
fn stamp_of(record: &Option<EngineState>) -> Option<u64> {
    record.as_ref().map(|r| r.timestamp)
}

/// Watch `store` and call `on_change` with the freshly read record after
/// every debounced change.
///
/// Must be called within a Tokio runtime. The callback runs on the watcher
/// task and should not block.
pub fn watch_state<F>(store: StateStore, config: WatcherConfig, on_change: F) -> Result<WatchHandle>
where
    F: FnMut(Option<EngineState>) + Send + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (fs_tx, fs_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();

    let watcher = if config.force_poll {
        None
    } else {
        match start_fs_watcher(&store, fs_tx) {
            Ok(w) => Some(w),
            Err(e) => {
                log::warn!("[WATCH] Filesystem watcher unavailable, polling instead: {}", e);
                None
            }
        }
    };
    let mode = if watcher.is_some() {
        WatchMode::Events
    } else {
        WatchMode::Poll
    };
    log::debug!("[WATCH] Watching {} ({:?})", store.path().display(), mode);

    // Changes are reported relative to what existed when watch_state returned.
    // Read after the filesystem watcher is up so a write in between is seen.
    let baseline = stamp_of(&store.read_record());

    tokio::spawn(run_watch_loop(
        store,
        config,
        baseline,
        watcher,
        fs_rx,
        shutdown_rx,
        on_change,
    ));

    Ok(WatchHandle {
        stopped: AtomicBool::new(false),
        shutdown: shutdown_tx,
        mode,
    })
}

fn start_fs_watcher(
    store: &StateStore,
    fs_tx: mpsc::UnboundedSender<notify::Result<notify::Event>>,
) -> Result<RecommendedWatcher> {
    let dir = store
        .path()
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| std::path::PathBuf::from("."));
    std::fs::create_dir_all(&dir)?;

    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = fs_tx.send(res);
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

async fn run_watch_loop<F>(
    store: StateStore,
    config: WatcherConfig,
    baseline: Option<u64>,
    watcher: Option<RecommendedWatcher>,
    mut fs_rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
    mut shutdown: watch::Receiver<bool>,
    mut on_change: F,
) where
    F: FnMut(Option<EngineState>) + Send + 'static,
{
    let event_mode = watcher.is_some();
    let file_name = store.path().file_name().map(|n| n.to_os_string());
    let mut debounce = Debounce::new(config.debounce);
    let mut poll = tokio::time::interval(config.poll_interval);
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut last_notified = baseline;
    let mut last_polled = baseline;

    loop {
        let deadline = debounce.deadline().unwrap_or_else(far_future);
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            Some(res) = fs_rx.recv(), if event_mode => {
                match res {
                    Ok(event) => {
                        let concerns_record = event.paths.iter().any(|p| {
                            p.file_name().map(|n| n.to_os_string()) == file_name
                        });
                        if concerns_record {
                            debounce.trigger(Instant::now());
                        }
                    }
                    Err(e) => log::debug!("[WATCH] Watch error: {}", e),
                }
            }
            _ = poll.tick(), if !event_mode => {
                let stamp = stamp_of(&store.read_record());
                if stamp != last_polled {
                    last_polled = stamp;
                    debounce.trigger(Instant::now());
                }
            }
            _ = tokio::time::sleep_until(deadline), if debounce.is_pending() => {
                if debounce.fire(Instant::now()) {
                    let record = store.read_record();
                    let stamp = stamp_of(&record);
                    if stamp != last_notified {
                        last_notified = stamp;
                        last_polled = stamp;
                        log::debug!("[WATCH] Engine record changed: {:?}", record);
                        on_change(record.filter(|r| r.is_valid()));
                    }
                }
            }
        }
    }

    drop(watcher);
}
