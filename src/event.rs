use tokio::sync::broadcast;

use crate::error::{ModelError, Result, ScanError};
use crate::fs::entry::Entry;

/// Events published by the directory model to its observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelEvent {
    /// A scan of new contents started.
    ScanStarted { directory: Entry },
    /// A batch of entries was appended to the visible list.
    ScanUpdated { directory: Entry },
    /// The current contents finished loading.
    ScanCompleted { directory: Entry },
    /// The current contents failed to load.
    ScanFailed {
        directory: Entry,
        error: ScanError,
        /// Whether an automatic retry has been scheduled.
        will_retry: bool,
    },
    /// The scan was superseded or cancelled.
    ScanCancelled { directory: Entry },
    /// A rescan or partial update was applied to the visible list.
    RescanCompleted { directory: Entry },
    /// A rescan failed; the stale list stays visible.
    RescanFailed {
        directory: Entry,
        error: ScanError,
        will_retry: bool,
    },
    /// The visible list is about to be swapped.
    BeginUpdateFiles,
    /// The visible list swap finished.
    EndUpdateFiles,
    /// The current directory changed.
    DirectoryChanged {
        previous: Option<Entry>,
        current: Entry,
        volume_changed: bool,
    },
    /// The selection changed.
    SelectionChanged,
}

impl ModelEvent {
    /// Short name used in logs and the CLI.
    pub fn name(&self) -> &'static str {
        match self {
            ModelEvent::ScanStarted { .. } => "scan-started",
            ModelEvent::ScanUpdated { .. } => "scan-updated",
            ModelEvent::ScanCompleted { .. } => "scan-completed",
            ModelEvent::ScanFailed { .. } => "scan-failed",
            ModelEvent::ScanCancelled { .. } => "scan-cancelled",
            ModelEvent::RescanCompleted { .. } => "rescan-completed",
            ModelEvent::RescanFailed { .. } => "rescan-failed",
            ModelEvent::BeginUpdateFiles => "begin-update-files",
            ModelEvent::EndUpdateFiles => "end-update-files",
            ModelEvent::DirectoryChanged { .. } => "directory-changed",
            ModelEvent::SelectionChanged => "selection-changed",
        }
    }
}

/// How a watched child changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    AddOrUpdate,
    Delete,
}

/// A single change reported by the file watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub url: String,
    pub change_type: ChangeType,
}

/// Change notification for a watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatcherEvent {
    pub directory: Entry,
    /// Per-entry detail. `None` means "something changed, rescan".
    pub changes: Option<Vec<FileChange>>,
}

/// File-operation notifications fed into the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntriesChangedKind {
    Created,
    Deleted,
}

/// Receiving end of the model's event stream.
pub struct ModelEvents {
    rx: broadcast::Receiver<ModelEvent>,
}

impl ModelEvents {
    pub fn new(rx: broadcast::Receiver<ModelEvent>) -> Self {
        Self { rx }
    }

    /// Receive the next event, skipping over any that were missed while
    /// the receiver lagged.
    pub async fn next(&mut self) -> Result<ModelEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event receiver lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ModelError::ModelStopped),
            }
        }
    }

    /// Drain every event that is already queued.
    pub fn drain(&mut self) -> Vec<ModelEvent> {
        let mut events = Vec::new();
        loop {
            match self.rx.try_recv() {
                Ok(event) => events.push(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_reports_closed_channel() {
        let (tx, rx) = broadcast::channel(4);
        let mut events = ModelEvents::new(rx);
        tx.send(ModelEvent::BeginUpdateFiles).unwrap();
        drop(tx);
        assert_eq!(events.next().await.unwrap(), ModelEvent::BeginUpdateFiles);
        assert!(matches!(events.next().await, Err(ModelError::ModelStopped)));
    }

    #[tokio::test]
    async fn next_skips_lag() {
        let (tx, rx) = broadcast::channel(2);
        let mut events = ModelEvents::new(rx);
        for _ in 0..3 {
            tx.send(ModelEvent::SelectionChanged).unwrap();
        }
        tx.send(ModelEvent::EndUpdateFiles).unwrap();
        assert_eq!(events.next().await.unwrap(), ModelEvent::SelectionChanged);
    }

    #[test]
    fn drain_collects_queued() {
        let (tx, rx) = broadcast::channel(8);
        let mut events = ModelEvents::new(rx);
        tx.send(ModelEvent::BeginUpdateFiles).unwrap();
        tx.send(ModelEvent::EndUpdateFiles).unwrap();
        let names: Vec<_> = events.drain().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec!["begin-update-files", "end-update-files"]);
        assert!(events.drain().is_empty());
    }
}
