use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::event::{EntriesChangedKind, ModelEvent, ModelEvents};
use crate::fs::entry::Entry;
use crate::fs::volume::VolumeInfo;
use crate::model::directory_model::{
    ChangeOutcome, Collaborators, Command, DirectoryModel, ModelConfig, ModelSnapshot,
    SearchCallbacks,
};

/// Cloneable front end of a running `DirectoryModel`.
///
/// Mutating calls are fire-and-forget and only fail once the model has
/// stopped. Queries round-trip through the model task and observe every
/// command sent before them.
#[derive(Clone)]
pub struct DirectoryModelHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<ModelEvent>,
}

impl DirectoryModelHandle {
    /// Spawn the model task on the current runtime. The task stops once
    /// every handle is dropped.
    pub fn spawn(collaborators: Collaborators, config: ModelConfig) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (model, receivers) =
            DirectoryModel::new(collaborators, config, events.clone(), commands_rx);
        tokio::spawn(model.run(receivers));
        debug!("Directory model started");
        Self { commands, events }
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ModelError::ModelStopped)
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(command(tx))?;
        rx.await.map_err(|_| ModelError::ModelStopped)
    }

    // ---- Navigation ----

    /// Navigate to `entry`. Requests issued in quick succession are
    /// serialized and only the last one takes effect.
    pub fn change_directory_entry(&self, entry: Entry) -> Result<PendingChange> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ChangeDirectory {
            entry,
            reply: Some(tx),
        })?;
        Ok(PendingChange { rx })
    }

    /// Like `change_directory_entry`, but activating the current directory
    /// only clears the selection.
    pub fn activate_directory_entry(&self, entry: Entry) -> Result<PendingChange> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::ActivateDirectory {
            entry,
            reply: Some(tx),
        })?;
        Ok(PendingChange { rx })
    }

    pub fn rescan(&self, refresh: bool) -> Result<()> {
        self.send(Command::Rescan { refresh })
    }

    pub fn rescan_soon(&self, refresh: bool) -> Result<()> {
        self.send(Command::RescanSoon { refresh })
    }

    pub fn rescan_later(&self, refresh: bool) -> Result<()> {
        self.send(Command::RescanLater { refresh })
    }

    pub fn schedule_rescan(&self, delay: Duration, refresh: bool) -> Result<()> {
        self.send(Command::ScheduleRescan { delay, refresh })
    }

    /// Search the current directory. An empty query restores the plain
    /// listing if a search was active.
    pub fn search(&self, query: impl Into<String>, callbacks: SearchCallbacks) -> Result<()> {
        self.send(Command::Search {
            query: query.into(),
            callbacks,
        })
    }

    // ---- Selection ----

    pub fn clear_selection(&self) -> Result<()> {
        self.send(Command::ClearSelection)
    }

    pub fn select_entry(&self, entry: Entry) -> Result<()> {
        self.send(Command::SelectEntry(entry))
    }

    pub fn select_entries(&self, entries: Vec<Entry>) -> Result<()> {
        self.send(Command::SelectEntries(entries))
    }

    pub fn select_index(&self, index: usize) -> Result<()> {
        self.send(Command::SelectIndex(index))
    }

    pub fn set_check_select_mode(&self, enabled: bool) -> Result<()> {
        self.send(Command::SetCheckSelectMode(enabled))
    }

    // ---- Notifications ----

    /// Apply a rename: `old` is replaced in place by `new`. Resolves once
    /// the list has been updated.
    pub async fn on_rename_entry(&self, old: Entry, new: Entry) -> Result<()> {
        self.request(|tx| Command::RenameEntry {
            old,
            new,
            reply: Some(tx),
        })
        .await
    }

    /// Show a freshly created directory and select it.
    pub async fn update_and_select_new_directory(&self, entry: Entry) -> Result<()> {
        self.request(|reply| Command::UpdateAndSelectNewDirectory { entry, reply })
            .await?
    }

    /// Report entries created or deleted by a file operation.
    pub fn entries_changed(&self, kind: EntriesChangedKind, entries: Vec<Entry>) -> Result<()> {
        self.send(Command::EntriesChanged { kind, entries })
    }

    pub fn set_ignoring_current_directory_deletion(&self, ignore: bool) -> Result<()> {
        self.send(Command::SetIgnoringCurrentDirectoryDeletion(ignore))
    }

    pub fn set_show_hidden(&self, show: bool) -> Result<()> {
        self.send(Command::SetShowHidden(show))
    }

    /// Report mounted and unmounted volumes. The volume manager must already
    /// reflect the change.
    pub fn volumes_changed(&self, added: Vec<VolumeInfo>, removed: Vec<VolumeInfo>) -> Result<()> {
        self.send(Command::VolumesChanged { added, removed })
    }

    pub fn set_my_files(&self, entry: Option<Entry>) -> Result<()> {
        self.send(Command::SetMyFiles(entry))
    }

    pub fn clear_last_search_query(&self) -> Result<()> {
        self.send(Command::ClearLastSearchQuery)
    }

    /// Stop watching and cancel any running scan.
    pub fn dispose(&self) -> Result<()> {
        self.send(Command::Dispose)
    }

    // ---- Queries ----

    pub async fn snapshot(&self) -> Result<ModelSnapshot> {
        self.request(Command::Snapshot).await
    }

    pub async fn current_dir_entry(&self) -> Result<Option<Entry>> {
        Ok(self.snapshot().await?.current_directory)
    }

    pub async fn is_scanning(&self) -> Result<bool> {
        Ok(self.snapshot().await?.is_scanning)
    }

    pub async fn is_searching(&self) -> Result<bool> {
        Ok(self.snapshot().await?.is_searching)
    }

    pub async fn file_list(&self) -> Result<Vec<Entry>> {
        Ok(self.snapshot().await?.files)
    }

    /// Currently selected entries, in list order.
    pub async fn selection(&self) -> Result<Vec<Entry>> {
        Ok(self.snapshot().await?.selected_entries())
    }

    pub async fn last_search_query(&self) -> Result<String> {
        Ok(self.snapshot().await?.last_search_query)
    }

    /// Resolve once no work is queued, running or scheduled.
    pub async fn wait_idle(&self) -> Result<()> {
        self.request(Command::WaitIdle).await
    }

    // ---- Observation ----

    pub fn subscribe(&self) -> ModelEvents {
        ModelEvents::new(self.events.subscribe())
    }

    pub fn create_directory_change_tracker(&self) -> DirectoryChangeTracker {
        DirectoryChangeTracker {
            events: self.events.clone(),
            rx: None,
            changed: false,
        }
    }
}

/// A navigation request in flight.
#[derive(Debug)]
pub struct PendingChange {
    rx: oneshot::Receiver<ChangeOutcome>,
}

impl PendingChange {
    /// Wait for the request to settle. A request dropped without an answer
    /// counts as cancelled.
    pub async fn outcome(self) -> ChangeOutcome {
        self.rx.await.unwrap_or(ChangeOutcome::Cancelled)
    }
}

/// Flags whether the current directory changed while it was started.
pub struct DirectoryChangeTracker {
    events: broadcast::Sender<ModelEvent>,
    rx: Option<broadcast::Receiver<ModelEvent>>,
    changed: bool,
}

impl DirectoryChangeTracker {
    pub fn start(&mut self) {
        self.changed = false;
        self.rx = Some(self.events.subscribe());
    }

    pub fn stop(&mut self) {
        self.poll();
        self.rx = None;
    }

    /// Whether a directory change was published since `start`. Stays set
    /// until the tracker is restarted.
    pub fn has_changed(&mut self) -> bool {
        self.poll();
        self.changed
    }

    fn poll(&mut self) {
        let Some(rx) = self.rx.as_mut() else {
            return;
        };
        loop {
            match rx.try_recv() {
                Ok(ModelEvent::DirectoryChanged { .. }) => self.changed = true,
                Ok(_) => {}
                Err(broadcast::error::TryRecvError::Lagged(_)) => self.changed = true,
                Err(_) => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::model::testing::{FakeMetadata, FakeVolumes, FakeWatcher, ScriptedScanner};

    fn handle() -> (DirectoryModelHandle, Arc<ScriptedScanner>) {
        let scanner = Arc::new(ScriptedScanner::new());
        scanner.set_listing("/docs", vec![Entry::file("local", "/docs/a.txt")]);
        scanner.set_listing("/docs/sub", Vec::new());
        let collaborators = Collaborators {
            volumes: Arc::new(FakeVolumes::new()),
            metadata: Arc::new(FakeMetadata::default()),
            scanner: scanner.clone(),
            watcher: Arc::new(FakeWatcher::default()),
        };
        (
            DirectoryModelHandle::spawn(collaborators, ModelConfig::default()),
            scanner,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_flags_directory_change() {
        let (model, _) = handle();
        let mut tracker = model.create_directory_change_tracker();
        assert!(!tracker.has_changed());

        tracker.start();
        model.rescan(false).unwrap();
        model.wait_idle().await.unwrap();
        assert!(!tracker.has_changed());

        let change = model
            .change_directory_entry(Entry::directory("local", "/docs"))
            .unwrap();
        assert_eq!(change.outcome().await, ChangeOutcome::Loaded);
        assert!(tracker.has_changed());

        model.rescan(false).unwrap();
        model.wait_idle().await.unwrap();
        assert!(tracker.has_changed());

        tracker.start();
        assert!(!tracker.has_changed());
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_tracker_ignores_later_changes() {
        let (model, _) = handle();
        let mut tracker = model.create_directory_change_tracker();
        tracker.start();
        tracker.stop();

        let change = model
            .change_directory_entry(Entry::directory("local", "/docs"))
            .unwrap();
        change.outcome().await;
        assert!(!tracker.has_changed());
    }

    #[tokio::test(start_paused = true)]
    async fn queries_follow_commands() {
        let (model, _) = handle();
        assert_eq!(model.current_dir_entry().await.unwrap(), None);

        let docs = Entry::directory("local", "/docs");
        let change = model.change_directory_entry(docs.clone()).unwrap();
        assert_eq!(change.outcome().await, ChangeOutcome::Loaded);

        assert_eq!(model.current_dir_entry().await.unwrap(), Some(docs));
        assert!(!model.is_scanning().await.unwrap());
        assert!(!model.is_searching().await.unwrap());
        assert_eq!(model.file_list().await.unwrap().len(), 1);

        model.select_index(0).unwrap();
        let selection = model.selection().await.unwrap();
        assert_eq!(selection, vec![Entry::file("local", "/docs/a.txt")]);
    }

    #[tokio::test(start_paused = true)]
    async fn events_reach_subscribers() {
        let (model, _) = handle();
        let mut events = model.subscribe();
        let docs = Entry::directory("local", "/docs");
        model.change_directory_entry(docs.clone()).unwrap();

        assert_eq!(
            events.next().await.unwrap(),
            ModelEvent::ScanStarted {
                directory: docs.clone()
            }
        );
        assert_eq!(
            events.next().await.unwrap(),
            ModelEvent::DirectoryChanged {
                previous: None,
                current: docs,
                volume_changed: true,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn activating_current_directory_keeps_listing() {
        let (model, scanner) = handle();
        let docs = Entry::directory("local", "/docs");
        model.change_directory_entry(docs.clone()).unwrap().outcome().await;
        model.select_index(0).unwrap();

        let outcome = model.activate_directory_entry(docs).unwrap().outcome().await;
        assert_eq!(outcome, ChangeOutcome::AlreadyCurrent);
        assert!(model.selection().await.unwrap().is_empty());
        assert_eq!(scanner.scan_count("/docs"), 1);

        let sub = Entry::directory("local", "/docs/sub");
        let outcome = model.activate_directory_entry(sub).unwrap().outcome().await;
        assert_eq!(outcome, ChangeOutcome::Loaded);
    }
}
