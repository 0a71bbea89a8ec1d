use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind, Debouncer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::{ChangeType, FileChange, WatcherEvent};
use crate::fs::entry::Entry;

/// Default patterns to ignore when watching the filesystem.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    ".git",
    "node_modules",
    "__pycache__",
    "venv",
    ".venv",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    "target",
];

/// Default debounce interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

/// Default flood threshold (events per debounce window).
pub const DEFAULT_FLOOD_THRESHOLD: usize = 100;

/// Watches the current directory on behalf of the model.
#[async_trait]
pub trait FileWatcher: Send + Sync {
    /// Stop watching the previous directory and start watching `entry`.
    /// Changes are delivered through `sink`.
    async fn change_watched_directory(
        &self,
        entry: &Entry,
        sink: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Result<()>;

    /// Stop watching altogether.
    fn stop(&self);
}

/// `FileWatcher` backed by notify with debouncing.
pub struct NotifyWatcher {
    debounce: Duration,
    ignore_patterns: Vec<String>,
    flood_threshold: usize,
    /// Whether the watcher is currently forwarding events.
    active: Arc<AtomicBool>,
    /// Dropped to stop watching.
    debouncer: Mutex<Option<Debouncer<notify::RecommendedWatcher>>>,
}

impl NotifyWatcher {
    pub fn new(debounce: Duration, ignore_patterns: Vec<String>, flood_threshold: usize) -> Self {
        Self {
            debounce,
            ignore_patterns,
            flood_threshold,
            active: Arc::new(AtomicBool::new(true)),
            debouncer: Mutex::new(None),
        }
    }

    /// Pause event forwarding (watcher stays alive to avoid re-creating inotify watches).
    pub fn pause(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    /// Resume event forwarding.
    pub fn resume(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    /// Check if the watcher is currently active (forwarding events).
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn is_watching(&self) -> bool {
        self.debouncer.lock().map(|d| d.is_some()).unwrap_or(false)
    }
}

impl Default for NotifyWatcher {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            DEFAULT_IGNORE_PATTERNS.iter().map(|s| s.to_string()).collect(),
            DEFAULT_FLOOD_THRESHOLD,
        )
    }
}

#[async_trait]
impl FileWatcher for NotifyWatcher {
    async fn change_watched_directory(
        &self,
        entry: &Entry,
        sink: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Result<()> {
        self.stop();

        let Some(volume_id) = entry.volume_id().map(str::to_string) else {
            // Fake roots have nothing on disk to watch.
            return Ok(());
        };

        let active = self.active.clone();
        let ignore_patterns = self.ignore_patterns.clone();
        let flood_threshold = self.flood_threshold;
        let directory = entry.clone();

        let mut debouncer = new_debouncer(
            self.debounce,
            move |result: std::result::Result<Vec<notify_debouncer_mini::DebouncedEvent>, notify::Error>| {
                if !active.load(Ordering::Relaxed) {
                    return;
                }

                match result {
                    Ok(events) => {
                        let paths: Vec<PathBuf> = events
                            .iter()
                            .filter(|e| e.kind == DebouncedEventKind::Any)
                            .map(|e| e.path.clone())
                            .filter(|p| {
                                !should_ignore(p, directory.path(), &ignore_patterns)
                            })
                            .collect();

                        if paths.is_empty() {
                            return;
                        }

                        let changes =
                            classify_changes(&volume_id, directory.path(), paths, flood_threshold);
                        let _ = sink.send(WatcherEvent {
                            directory: directory.clone(),
                            changes,
                        });
                    }
                    Err(e) => warn!(error = %e, "File watcher error"),
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(entry.path(), notify::RecursiveMode::NonRecursive)?;
        debug!(directory = %entry, "Watching directory");

        if let Ok(mut slot) = self.debouncer.lock() {
            *slot = Some(debouncer);
        }
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut slot) = self.debouncer.lock() {
            slot.take();
        }
    }
}

/// Turn debounced paths into per-entry changes.
///
/// A flood of events, or an event on the watched directory itself, collapses
/// into `None` so the model falls back to a full rescan.
pub fn classify_changes(
    volume_id: &str,
    directory: &Path,
    paths: Vec<PathBuf>,
    flood_threshold: usize,
) -> Option<Vec<FileChange>> {
    if paths.len() > flood_threshold || paths.iter().any(|p| p == directory) {
        return None;
    }
    Some(
        paths
            .into_iter()
            .map(|path| FileChange {
                url: Entry::url_for(volume_id, &path),
                change_type: if path.exists() {
                    ChangeType::AddOrUpdate
                } else {
                    ChangeType::Delete
                },
            })
            .collect(),
    )
}

/// Check if a path should be ignored based on ignore patterns.
///
/// A path is ignored if any of its components below `base` match any ignore
/// pattern exactly. Ancestors of `base` are never matched.
pub fn should_ignore(path: &Path, base: &Path, patterns: &[String]) -> bool {
    let relative = path.strip_prefix(base).unwrap_or(path);
    for component in relative.components() {
        if let std::path::Component::Normal(name) = component {
            let name_str = name.to_string_lossy();
            for pattern in patterns {
                if name_str == *pattern {
                    return true;
                }
            }
        }
    }
    false
}
