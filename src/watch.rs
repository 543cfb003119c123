//! Watch mode.
//!
//! [`watch`] runs the pipeline once, then again after every debounced burst
//! of change events, until the token is cancelled. Runs never overlap: the
//! loop awaits each run before looking at the next trigger, and events that
//! arrive meanwhile are coalesced by the debouncer.
//!
//! Change events come from any channel. [`FsNotifier`] feeds one from
//! filesystem notifications on the scanners' paths.

use crate::debounce::debounce;
use crate::pipeline::{Pipeline, PipelineError};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("filesystem watcher error: {0}")]
    Notify(#[from] notify::Error),
    #[error("failed to watch {}: {source}", .path.display())]
    Path { path: PathBuf, source: notify::Error },
}

/// Outcome of a watch session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchStats {
    pub runs: usize,
    pub failed: usize,
}

/// Run `pipeline` now and after every quiet window following a change event.
///
/// Failed runs are logged and the loop goes on. If the event stream closes,
/// the loop keeps waiting; only `cancel` ends it.
pub async fn watch<T>(
    pipeline: &Pipeline,
    cancel: &CancellationToken,
    events: mpsc::Receiver<T>,
    window: Duration,
    keep_last: bool,
) -> WatchStats
where
    T: Send + 'static,
{
    let mut triggers = debounce(events, window, keep_last);
    let mut stats = WatchStats::default();
    let mut triggers_open = true;

    run_once(pipeline, cancel, &mut stats).await;
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            trigger = triggers.recv(), if triggers_open => match trigger {
                Some(_) => {
                    info!("change detected, rebuilding");
                    run_once(pipeline, cancel, &mut stats).await;
                }
                None => {
                    debug!("change stream closed, waiting for cancellation");
                    triggers_open = false;
                }
            },
        }
    }

    info!(runs = stats.runs, failed = stats.failed, "watch stopped");
    stats
}

async fn run_once(pipeline: &Pipeline, cancel: &CancellationToken, stats: &mut WatchStats) {
    stats.runs += 1;
    match pipeline.run(cancel).await {
        Ok(run) => info!(written = run.written, "rebuild finished"),
        Err(PipelineError::Cancelled) => debug!("rebuild cancelled"),
        Err(err) => {
            stats.failed += 1;
            error!(error = %err, "rebuild failed");
        }
    }
}

/// Filesystem change notifications for a set of paths.
///
/// Keeps the underlying watcher alive; dropping it stops the notifications
/// and closes the event channel.
pub struct FsNotifier {
    _watcher: RecommendedWatcher,
}

impl FsNotifier {
    /// Watch every path recursively. Each relevant event sends its first path
    /// on the returned channel. Events are dropped while the channel is full,
    /// since one pending event is enough to trigger a rebuild.
    pub fn start(
        paths: &[PathBuf],
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<PathBuf>), WatchError> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    if !is_change(&event.kind) {
                        return;
                    }
                    if let Some(path) = event.paths.into_iter().next() {
                        debug!(path = %path.display(), "change event");
                        let _ = tx.try_send(path);
                    }
                }
                Err(err) => warn!(error = %err, "watch error"),
            },
            Config::default(),
        )?;

        for path in paths {
            watcher
                .watch(path, RecursiveMode::Recursive)
                .map_err(|source| WatchError::Path {
                    path: path.clone(),
                    source,
                })?;
            info!(path = %path.display(), "watching");
        }
        Ok((Self { _watcher: watcher }, rx))
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}
