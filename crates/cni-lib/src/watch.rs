//! Directory change notifications
//!
//! Wraps a non-recursive `notify` watcher on a single directory and turns its
//! callback stream into two channels: one carrying a "something changed"
//! signal per filesystem event, one carrying watcher errors. The channels are
//! unbounded so the notify dispatch thread never blocks on a slow consumer and
//! no event is dropped between receives.

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors from the watch subsystem
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {path}: {source}")]
    Setup {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("file watcher stopped")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}

/// Receiving side of a directory watch
#[derive(Debug)]
pub struct WatchEvents {
    pub changes: UnboundedReceiver<()>,
    pub errors: UnboundedReceiver<notify::Error>,
}

impl WatchEvents {
    /// Take an already queued error or change without blocking
    pub fn has_pending(&mut self) -> Option<Result<(), WatchError>> {
        if let Ok(err) = self.errors.try_recv() {
            return Some(Err(WatchError::Notify(err)));
        }
        if self.changes.try_recv().is_ok() {
            return Some(Ok(()));
        }
        None
    }
}

/// Sending side, held by the notify callback
#[derive(Debug, Clone)]
pub(crate) struct WatchSenders {
    changes: UnboundedSender<()>,
    errors: UnboundedSender<notify::Error>,
}

impl WatchSenders {
    pub(crate) fn forward(&self, res: Result<Event, notify::Error>) {
        match res {
            Ok(event) => {
                debug!(kind = ?event.kind, paths = ?event.paths, "Watched directory changed");
                let _ = self.changes.send(());
            }
            Err(e) => {
                let _ = self.errors.send(e);
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn send_change(&self) {
        let _ = self.changes.send(());
    }

    #[cfg(test)]
    pub(crate) fn send_error(&self, err: notify::Error) {
        let _ = self.errors.send(err);
    }
}

pub(crate) fn event_channels() -> (WatchSenders, WatchEvents) {
    let (changes_tx, changes_rx) = mpsc::unbounded_channel();
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();

    (
        WatchSenders {
            changes: changes_tx,
            errors: errors_tx,
        },
        WatchEvents {
            changes: changes_rx,
            errors: errors_rx,
        },
    )
}

/// Handle to a running watch
/// Stops watching when dropped
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    dir: PathBuf,
}

impl FileWatcher {
    /// Directory being watched
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Start watching `dir` (non-recursive)
pub fn watch(dir: &Path) -> Result<(FileWatcher, WatchEvents), WatchError> {
    let (senders, events) = event_channels();

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| senders.forward(res),
        notify::Config::default(),
    )
    .map_err(|source| WatchError::Setup {
        path: dir.to_path_buf(),
        source,
    })?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .map_err(|source| WatchError::Setup {
            path: dir.to_path_buf(),
            source,
        })?;
    debug!(path = %dir.display(), "Watching directory");

    Ok((
        FileWatcher {
            _watcher: watcher,
            dir: dir.to_path_buf(),
        },
        events,
    ))
}

/// Block until a change arrives (`Ok`), the watcher reports an error, or
/// `cancel` fires (`WatchError::Cancelled`)
pub async fn wait_for_change_or_cancel(
    events: &mut WatchEvents,
    cancel: &CancellationToken,
) -> Result<(), WatchError> {
    tokio::select! {
        change = events.changes.recv() => match change {
            Some(()) => Ok(()),
            None => Err(WatchError::Closed),
        },
        err = events.errors.recv() => match err {
            Some(e) => Err(WatchError::Notify(e)),
            None => Err(WatchError::Closed),
        },
        _ = cancel.cancelled() => Err(WatchError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_watch_reports_file_creation() {
        let dir = TempDir::new().unwrap();
        let (_watcher, mut events) = watch(dir.path()).unwrap();

        std::fs::write(dir.path().join("10-calico.conflist"), b"{}").unwrap();

        let cancel = CancellationToken::new();
        let res = timeout(
            Duration::from_secs(5),
            wait_for_change_or_cancel(&mut events, &cancel),
        )
        .await
        .expect("no change event within timeout");
        assert!(res.is_ok());
    }

    #[test]
    fn test_watch_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        let res = watch(&dir.path().join("does-not-exist"));
        assert!(matches!(res, Err(WatchError::Setup { .. })));
    }

    #[tokio::test]
    async fn test_wait_returns_on_cancel() {
        let (_senders, mut events) = event_channels();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let res = wait_for_change_or_cancel(&mut events, &cancel).await;
        assert!(matches!(res, Err(WatchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_wait_returns_watcher_error() {
        let (senders, mut events) = event_channels();
        senders.send_error(notify::Error::generic("inotify queue overflow"));

        let cancel = CancellationToken::new();
        let res = wait_for_change_or_cancel(&mut events, &cancel).await;
        assert!(matches!(res, Err(WatchError::Notify(_))));
    }

    #[tokio::test]
    async fn test_events_are_not_dropped_between_receives() {
        let (senders, mut events) = event_channels();
        for _ in 0..3 {
            senders.send_change();
        }

        let cancel = CancellationToken::new();
        for _ in 0..3 {
            wait_for_change_or_cancel(&mut events, &cancel)
                .await
                .unwrap();
        }
        assert!(events.has_pending().is_none());
    }

    #[tokio::test]
    async fn test_closed_channels_report_closed() {
        let (senders, mut events) = event_channels();
        drop(senders);

        let cancel = CancellationToken::new();
        let res = wait_for_change_or_cancel(&mut events, &cancel).await;
        assert!(matches!(res, Err(WatchError::Closed)));
    }
}
