// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Debounced watch loop.
//!
//! Watch the synchronization root, coalesce bursts of filesystem changes, and
//! trigger one push per burst. The loop moves through these states:
//!
//! ```text
//! Idle -> Watching -> Debouncing -> Triggering -> Watching
//!            \            \             \
//!             +------------+-------------+--> Stopped
//! ```
//!
//! A change moves the loop from watching to debouncing, and (re)arms the delay
//! timer. Once the timer expires without further changes, the loop triggers a
//! push with every changed path collected so far, and goes back to watching.
//! A delay of zero disables coalescing, so every change triggers on its own.
//!
//! # Failure Semantics
//!
//! A failing push is logged and the loop keeps watching. Only losing the
//! synchronization root, or a push error that says so through
//! [`PushError::stops_watch`], stops the loop.
//!
//! # Cancellation
//!
//! [`StopHandle::stop`] is checked at every state transition. A push already
//! triggered runs to completion, but nothing fires after it.

use crate::{ignore_rules::IgnoreSet, push::PushError};

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{channel, Receiver, RecvTimeoutError, Sender},
        Arc,
    },
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};

/// State of a [`WatchLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Idle,
    Watching,
    Debouncing,
    Triggering,
    Stopped,
}

#[derive(Debug)]
enum Signal {
    Changes(Vec<PathBuf>),
    Failed(String),
    Stop,
}

/// Stop a running watch loop from anywhere.
#[derive(Debug, Clone)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
    sender: Sender<Signal>,
}

impl StopHandle {
    /// Request stop. No push is triggered after this returns.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);

        // INVARIANT: A loop that already exited dropped its receiver.
        let _ = self.sender.send(Signal::Stop);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

/// Feed filesystem changes into a watch loop.
#[derive(Debug, Clone)]
pub struct ChangeSender(Sender<Signal>);

impl ChangeSender {
    /// Report changed paths. Returns `false` once the loop is gone.
    pub fn changed(&self, paths: Vec<PathBuf>) -> bool {
        self.0.send(Signal::Changes(paths)).is_ok()
    }

    /// Report failure of the underlying notifier.
    pub fn failed(&self, reason: impl Into<String>) -> bool {
        self.0.send(Signal::Failed(reason.into())).is_ok()
    }
}

/// What a finished watch loop did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WatchSummary {
    pub triggers: usize,
    pub failures: usize,
}

/// Debounced watch loop over one synchronization root.
#[derive(Debug)]
pub struct WatchLoop {
    delay: Duration,
    ignore: IgnoreSet,
    state: WatchState,
    stopped: Arc<AtomicBool>,
    sender: Sender<Signal>,
    receiver: Receiver<Signal>,
}

impl WatchLoop {
    pub fn new(delay: Duration, ignore: IgnoreSet) -> Self {
        let (sender, receiver) = channel();
        Self {
            delay,
            ignore,
            state: WatchState::Idle,
            stopped: Arc::new(AtomicBool::new(false)),
            sender,
            receiver,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stopped: Arc::clone(&self.stopped),
            sender: self.sender.clone(),
        }
    }

    pub fn change_sender(&self) -> ChangeSender {
        ChangeSender(self.sender.clone())
    }

    /// Watch synchronization root with the platform's native notifier, and
    /// trigger pushes until stopped.
    ///
    /// # Errors
    ///
    /// - Return [`WatchError::Notify`] if the notifier cannot be set up.
    /// - Return any error [`WatchLoop::run`] returns.
    #[instrument(skip(self, trigger), level = "debug")]
    pub fn watch<F>(&mut self, trigger: F) -> Result<WatchSummary>
    where
        F: FnMut(&[PathBuf]) -> Result<(), PushError>,
    {
        let changes = self.change_sender();
        let mut watcher: RecommendedWatcher =
            notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
                match result {
                    Ok(event) if matches!(event.kind, EventKind::Access(_)) => {}
                    Ok(event) => {
                        changes.changed(event.paths);
                    }
                    Err(err) => {
                        changes.failed(err.to_string());
                    }
                }
            })?;
        watcher.watch(self.ignore.root(), RecursiveMode::Recursive)?;
        info!("watching {} for changes", self.ignore.root().display());

        self.run(trigger)
    }

    /// Process signals until stopped.
    ///
    /// # Errors
    ///
    /// - Return [`WatchError::RootLost`] if the synchronization root vanished.
    /// - Return [`WatchError::Push`] if a push failed in a way that must stop
    ///   watching.
    pub fn run<F>(&mut self, mut trigger: F) -> Result<WatchSummary>
    where
        F: FnMut(&[PathBuf]) -> Result<(), PushError>,
    {
        let mut summary = WatchSummary::default();
        let mut pending = BTreeSet::new();
        let mut deadline: Option<Instant> = None;

        if self.delay.is_zero() {
            warn!("watch delay is zero, every single change triggers a push and may cause excessive churn");
        }

        self.state = WatchState::Watching;
        loop {
            if self.stop_requested() {
                break;
            }

            let signal = match deadline {
                None => match self.receiver.recv() {
                    Ok(signal) => Some(signal),
                    Err(_) => break,
                },
                Some(deadline) => {
                    let timeout = deadline.saturating_duration_since(Instant::now());
                    match self.receiver.recv_timeout(timeout) {
                        Ok(signal) => Some(signal),
                        Err(RecvTimeoutError::Timeout) => None,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            };

            match signal {
                Some(Signal::Stop) => break,
                Some(Signal::Failed(reason)) => {
                    self.check_root()?;
                    warn!("filesystem notifier failed: {reason}");
                    continue;
                }
                Some(Signal::Changes(paths)) => {
                    let relevant = paths
                        .into_iter()
                        .filter(|path| !self.ignore.is_ignored(path))
                        .collect::<Vec<_>>();
                    if relevant.is_empty() {
                        continue;
                    }
                    pending.extend(relevant);

                    if !self.delay.is_zero() {
                        debug!("debounce {} pending change(s)", pending.len());
                        deadline = Some(Instant::now() + self.delay);
                        self.state = WatchState::Debouncing;
                        continue;
                    }
                }
                None => {}
            }

            if self.stop_requested() {
                break;
            }

            self.check_root()?;
            self.state = WatchState::Triggering;
            deadline = None;
            let paths = std::mem::take(&mut pending).into_iter().collect::<Vec<_>>();
            summary.triggers += 1;
            debug!("trigger push for {} change(s)", paths.len());

            match trigger(&paths) {
                Ok(()) => {}
                Err(err) if err.stops_watch() => {
                    error!("stop watching: {err}");
                    self.state = WatchState::Stopped;
                    return Err(WatchError::Push(err));
                }
                Err(err) => {
                    summary.failures += 1;
                    error!("push failed, still watching: {err}: {}", err.hint());
                }
            }

            self.state = WatchState::Watching;
        }

        self.state = WatchState::Stopped;
        info!("stopped watching after {} push(es)", summary.triggers);
        Ok(summary)
    }

    fn stop_requested(&mut self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            self.state = WatchState::Stopped;
            return true;
        }
        false
    }

    fn check_root(&mut self) -> Result<()> {
        let root = self.ignore.root();
        if let Err(err) = root.read_dir() {
            self.state = WatchState::Stopped;
            return Err(WatchError::RootLost {
                source: err,
                root: root.to_path_buf(),
            });
        }
        Ok(())
    }
}

/// Watch loop error types.
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// Synchronization root was removed or became unreadable.
    #[error("synchronization root {:?} is gone", root.display())]
    RootLost {
        #[source]
        source: std::io::Error,
        root: PathBuf,
    },

    /// Push failed in a way that must stop watching.
    #[error(transparent)]
    Push(#[from] PushError),

    /// Filesystem notifier cannot be set up.
    #[error(transparent)]
    Notify(#[from] notify::Error),
}

/// Friendly result alias :3
pub type Result<T, E = WatchError> = std::result::Result<T, E>;
