use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{ModelError, Result, ScanError};
use crate::event::{ChangeType, EntriesChangedKind, ModelEvent, WatcherEvent};
use crate::fs::entry::{entries_to_urls, Entry, RootType};
use crate::fs::filter::FileFilter;
use crate::fs::metadata::MetadataModel;
use crate::fs::scanner::{ContentScanner, MetadataSearchType, ScanSource};
use crate::fs::volume::{ResolvedUrls, VolumeInfo, VolumeManager, VolumeType};
use crate::fs::watcher::FileWatcher;
use crate::model::contents::{
    ContentsArena, ContentsId, DirectoryContents, FileList, ScanEvent, ScanStatus,
};
use crate::model::debounce::{Aggregator, AggregatorRun, RescanScheduler};
use crate::model::queue::{Sequenced, SequencedTaskQueue};
use crate::model::selection::{SelectionModel, SelectionSnapshot};

/// Timing and policy knobs for the model.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Delay used by `rescan_soon`.
    pub short_interval: Duration,
    /// Delay used by `rescan_later`.
    pub coalesce_interval: Duration,
    /// Window of the watcher rescan aggregator.
    pub aggregator_window: Duration,
    /// Consecutive scan failures that still trigger an automatic retry.
    pub max_auto_retries: u32,
    pub single_selection: bool,
    pub show_hidden: bool,
    /// Capacity of the outward event channel.
    pub event_capacity: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            short_interval: Duration::from_millis(100),
            coalesce_interval: Duration::from_millis(500),
            aggregator_window: Duration::from_millis(500),
            max_auto_retries: 1,
            single_selection: false,
            show_hidden: false,
            event_capacity: 1024,
        }
    }
}

/// Everything the model consumes from the outside world.
#[derive(Clone)]
pub struct Collaborators {
    pub volumes: Arc<dyn VolumeManager>,
    pub metadata: Arc<dyn MetadataModel>,
    pub scanner: Arc<dyn ContentScanner>,
    pub watcher: Arc<dyn FileWatcher>,
}

/// How a directory change request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// The directory is current and fully listed.
    Loaded,
    /// The directory is current but its listing failed.
    Failed(ScanError),
    /// The listing was cancelled before it completed.
    Cancelled,
    /// A newer request took over before this one took effect.
    Superseded,
    /// No contents can be built for the entry.
    Unresolvable,
    /// The entry was already current; only the selection was cleared.
    AlreadyCurrent,
}

/// Callbacks attached to a search.
#[derive(Default)]
pub struct SearchCallbacks {
    on_rescan: Option<Box<dyn FnMut() + Send>>,
    on_clear: Option<Box<dyn FnOnce() + Send>>,
}

impl SearchCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called every time the search results finish loading.
    pub fn on_rescan(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_rescan = Some(Box::new(f));
        self
    }

    /// Called once when the search state is cleared.
    pub fn on_clear(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_clear = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for SearchCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchCallbacks")
            .field("on_rescan", &self.on_rescan.is_some())
            .field("on_clear", &self.on_clear.is_some())
            .finish()
    }
}

/// Point-in-time view of the model.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSnapshot {
    pub current_directory: Option<Entry>,
    pub is_scanning: bool,
    pub is_searching: bool,
    pub files: Vec<Entry>,
    pub selected_indexes: Vec<usize>,
    pub lead_index: Option<usize>,
    pub check_select_mode: bool,
    pub last_search_query: String,
    pub volume: Option<VolumeInfo>,
    pub root_type: Option<RootType>,
    pub is_read_only: bool,
    pub is_on_drive: bool,
    pub sequence: u64,
    pub scan_failures: u32,
}

impl ModelSnapshot {
    pub fn selected_entries(&self) -> Vec<Entry> {
        self.selected_indexes
            .iter()
            .filter_map(|&i| self.files.get(i).cloned())
            .collect()
    }

    pub fn file_names(&self) -> Vec<&str> {
        self.files.iter().map(Entry::name).collect()
    }

    pub fn selected_names(&self) -> Vec<&str> {
        self.selected_indexes
            .iter()
            .filter_map(|&i| self.files.get(i).map(Entry::name))
            .collect()
    }
}

/// Requests sent by `DirectoryModelHandle`.
#[derive(Debug)]
pub enum Command {
    ChangeDirectory {
        entry: Entry,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
    },
    ActivateDirectory {
        entry: Entry,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
    },
    Rescan {
        refresh: bool,
    },
    RescanSoon {
        refresh: bool,
    },
    RescanLater {
        refresh: bool,
    },
    ScheduleRescan {
        delay: Duration,
        refresh: bool,
    },
    Search {
        query: String,
        callbacks: SearchCallbacks,
    },
    ClearSelection,
    SelectEntry(Entry),
    SelectEntries(Vec<Entry>),
    SelectIndex(usize),
    SetCheckSelectMode(bool),
    RenameEntry {
        old: Entry,
        new: Entry,
        reply: Option<oneshot::Sender<()>>,
    },
    UpdateAndSelectNewDirectory {
        entry: Entry,
        reply: oneshot::Sender<Result<()>>,
    },
    EntriesChanged {
        kind: EntriesChangedKind,
        entries: Vec<Entry>,
    },
    SetIgnoringCurrentDirectoryDeletion(bool),
    SetShowHidden(bool),
    VolumesChanged {
        added: Vec<VolumeInfo>,
        removed: Vec<VolumeInfo>,
    },
    SetMyFiles(Option<Entry>),
    ClearLastSearchQuery,
    Snapshot(oneshot::Sender<ModelSnapshot>),
    WaitIdle(oneshot::Sender<()>),
    Dispose,
}

/// Queued directory-change work.
#[derive(Debug)]
enum DirTask {
    Change {
        entry: Entry,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
    },
    Search {
        query: String,
        callbacks: SearchCallbacks,
    },
}

/// Results of spawned work, delivered back to the model task.
enum ModelMessage {
    WatcherReady {
        sequence: u64,
        entry: Entry,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
    },
    QueueTaskDone,
    RescanTimer(u64),
    AggregatorTimer(u64),
    DirectoryChecked {
        directory: Entry,
        exists: bool,
    },
    UrlsResolved {
        directory: Entry,
        resolved: Result<ResolvedUrls>,
        deleted: Vec<String>,
    },
    RenamePrefetched {
        old: Entry,
        new: Entry,
        reply: Option<oneshot::Sender<()>>,
    },
    NewDirectoryPrefetched {
        sequence: u64,
        entry: Entry,
        reply: oneshot::Sender<Result<()>>,
    },
    ReplayPartialUpdate {
        changed: Vec<Entry>,
        removed: Vec<String>,
    },
    Prefetched,
}

struct Envelope {
    message: ModelMessage,
    /// Counted against `in_flight` until handled.
    tracked: bool,
}

/// Why a scan is running and what to do with its results.
enum ScanPurpose {
    /// Directory change or search: fills the visible list.
    Navigate {
        sequence: u64,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
        /// Set once the caller has been answered.
        settled: bool,
    },
    /// Shadow rescan of the current location.
    Rescan { sequence: u64 },
    /// Incremental delta applied to the visible list.
    PartialUpdate,
}

struct ScanRecord {
    purpose: ScanPurpose,
    refresh: bool,
}

/// A partial update waiting for a running scan to complete.
struct DeferredUpdate {
    after: ContentsId,
    changed: Vec<Entry>,
    removed: Vec<String>,
}

/// Channels the model task reads from.
pub struct Receivers {
    commands: mpsc::UnboundedReceiver<Command>,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    scans: mpsc::UnboundedReceiver<(ContentsId, ScanEvent)>,
    watcher: mpsc::UnboundedReceiver<WatcherEvent>,
}

/// The directory model. Owns all state and runs as a single task; see
/// `DirectoryModelHandle` for the public surface.
pub struct DirectoryModel {
    config: ModelConfig,
    collaborators: Collaborators,
    events: broadcast::Sender<ModelEvent>,
    inbox: mpsc::UnboundedSender<Envelope>,
    scan_sink: mpsc::UnboundedSender<(ContentsId, ScanEvent)>,
    watcher_sink: mpsc::UnboundedSender<WatcherEvent>,

    sequence: u64,
    queue: SequencedTaskQueue<DirTask>,
    arena: ContentsArena,
    selection: SelectionModel,
    filter: FileFilter,
    rescan_timer: RescanScheduler,
    aggregator: Aggregator,

    scans: HashMap<ContentsId, ScanRecord>,
    running_scan: Option<ContentsId>,
    pending_rescan: bool,
    deferred: Vec<DeferredUpdate>,
    scan_failures: u32,

    search_callbacks: Option<SearchCallbacks>,
    last_search_query: String,
    my_files: Option<Entry>,
    ignore_current_directory_deletion: bool,

    in_flight: usize,
    idle_waiters: Vec<oneshot::Sender<()>>,
    disposed: bool,
}

impl DirectoryModel {
    /// Build the model and the receivers its task will read from.
    pub fn new(
        collaborators: Collaborators,
        config: ModelConfig,
        events: broadcast::Sender<ModelEvent>,
        commands: mpsc::UnboundedReceiver<Command>,
    ) -> (Self, Receivers) {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        let (scan_sink, scans_rx) = mpsc::unbounded_channel();
        let (watcher_sink, watcher_rx) = mpsc::unbounded_channel();

        let model = Self {
            selection: SelectionModel::new(config.single_selection),
            filter: FileFilter::new(config.show_hidden),
            aggregator: Aggregator::new(config.aggregator_window),
            config,
            collaborators,
            events,
            inbox,
            scan_sink,
            watcher_sink,
            sequence: 0,
            queue: SequencedTaskQueue::new(),
            arena: ContentsArena::new(),
            rescan_timer: RescanScheduler::new(),
            scans: HashMap::new(),
            running_scan: None,
            pending_rescan: false,
            deferred: Vec::new(),
            scan_failures: 0,
            search_callbacks: None,
            last_search_query: String::new(),
            my_files: None,
            ignore_current_directory_deletion: false,
            in_flight: 0,
            idle_waiters: Vec::new(),
            disposed: false,
        };
        let receivers = Receivers {
            commands,
            inbox: inbox_rx,
            scans: scans_rx,
            watcher: watcher_rx,
        };
        (model, receivers)
    }

    /// Process messages until every handle is dropped.
    pub async fn run(mut self, receivers: Receivers) {
        let Receivers {
            mut commands,
            mut inbox,
            mut scans,
            mut watcher,
        } = receivers;

        loop {
            tokio::select! {
                biased;
                Some(envelope) = inbox.recv() => self.handle_message(envelope),
                Some((id, event)) = scans.recv() => self.handle_scan_event(id, event),
                Some(event) = watcher.recv() => {
                    // Commands sent before the event was handled apply first.
                    while let Ok(command) = commands.try_recv() {
                        self.handle_command(command);
                    }
                    self.on_watcher_event(event);
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
            }
            self.notify_idle();
        }

        self.dispose();
        debug!("Directory model stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ChangeDirectory { entry, reply } => self.change_directory_entry(entry, reply),
            Command::ActivateDirectory { entry, reply } => {
                self.activate_directory_entry(entry, reply)
            }
            Command::Rescan { refresh } => self.rescan(refresh),
            Command::RescanSoon { refresh } => self.rescan_soon(refresh),
            Command::RescanLater { refresh } => self.rescan_later(refresh),
            Command::ScheduleRescan { delay, refresh } => self.schedule_rescan(delay, refresh),
            Command::Search { query, callbacks } => self.search(query, callbacks),
            Command::ClearSelection => self.clear_selection(),
            Command::SelectEntry(entry) => self.select_entry(&entry),
            Command::SelectEntries(entries) => self.select_entries(&entries),
            Command::SelectIndex(index) => self.select_index(index),
            Command::SetCheckSelectMode(enabled) => self.update_selection(|selection, _| {
                selection.set_check_select_mode(enabled);
                false
            }),
            Command::RenameEntry { old, new, reply } => self.on_rename_entry(old, new, reply),
            Command::UpdateAndSelectNewDirectory { entry, reply } => {
                self.update_and_select_new_directory(entry, reply)
            }
            Command::EntriesChanged { kind, entries } => self.on_entries_changed(kind, entries),
            Command::SetIgnoringCurrentDirectoryDeletion(value) => {
                self.ignore_current_directory_deletion = value
            }
            Command::SetShowHidden(show) => self.set_show_hidden(show),
            Command::VolumesChanged { added, removed } => self.on_volumes_changed(added, removed),
            Command::SetMyFiles(entry) => self.my_files = entry,
            Command::ClearLastSearchQuery => self.last_search_query.clear(),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
            Command::WaitIdle(reply) => self.idle_waiters.push(reply),
            Command::Dispose => self.dispose(),
        }
    }

    fn handle_message(&mut self, envelope: Envelope) {
        if envelope.tracked {
            self.in_flight = self.in_flight.saturating_sub(1);
        }
        match envelope.message {
            ModelMessage::WatcherReady {
                sequence,
                entry,
                reply,
            } => self.on_watcher_ready(sequence, entry, reply),
            ModelMessage::QueueTaskDone => self.finish_queue_task(),
            ModelMessage::RescanTimer(id) => {
                if let Some(scheduled) = self.rescan_timer.fire(id) {
                    if scheduled.sequence == self.sequence {
                        self.rescan(scheduled.refresh);
                    } else {
                        debug!("Dropping rescan scheduled for a previous directory");
                    }
                }
            }
            ModelMessage::AggregatorTimer(id) => {
                if self.aggregator.fire(id) {
                    self.rescan_soon(true);
                }
            }
            ModelMessage::DirectoryChecked { directory, exists } => {
                if !exists && self.current_dir_entry() == Some(&directory) {
                    info!(directory = %directory, "Current directory was removed");
                    let volumes = &self.collaborators.volumes;
                    let root = volumes
                        .volume_info(&directory)
                        .map(|v| v.display_root())
                        .or_else(|| volumes.default_display_root());
                    if let Some(root) = root {
                        self.change_directory_entry(root, None);
                    }
                }
            }
            ModelMessage::UrlsResolved {
                directory,
                resolved,
                mut deleted,
            } => {
                if self.current_dir_entry() != Some(&directory) {
                    return;
                }
                match resolved {
                    Ok(resolved) => {
                        deleted.extend(resolved.failures);
                        self.partial_update(resolved.entries, deleted);
                    }
                    Err(e) => {
                        warn!(error = %e, "Resolving changed entries failed, falling back to rescan");
                        self.run_aggregator();
                    }
                }
            }
            ModelMessage::RenamePrefetched { old, new, reply } => {
                self.apply_rename(old, new);
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
            }
            ModelMessage::NewDirectoryPrefetched {
                sequence,
                entry,
                reply,
            } => {
                let result = if sequence == self.sequence {
                    self.select_new_directory(entry);
                    Ok(())
                } else {
                    Err(ModelError::DirectoryChanged)
                };
                let _ = reply.send(result);
            }
            ModelMessage::ReplayPartialUpdate { changed, removed } => {
                self.partial_update(changed, removed)
            }
            ModelMessage::Prefetched => {}
        }
    }

    // ---- Spawned work ----

    /// Run `work` on its own task and deliver its result through the inbox.
    fn spawn_work<F>(&mut self, work: F)
    where
        F: std::future::Future<Output = ModelMessage> + Send + 'static,
    {
        self.in_flight += 1;
        let inbox = self.inbox.clone();
        tokio::spawn(async move {
            let message = work.await;
            let _ = inbox.send(Envelope {
                message,
                tracked: true,
            });
        });
    }

    /// Deliver `message` on a later turn of the loop.
    fn post(&mut self, message: ModelMessage) {
        self.in_flight += 1;
        let _ = self.inbox.send(Envelope {
            message,
            tracked: true,
        });
    }

    fn emit(&self, event: ModelEvent) {
        debug!(event = event.name(), "Model event");
        let _ = self.events.send(event);
    }

    // ---- Directory change queue ----

    fn change_directory_entry(
        &mut self,
        entry: Entry,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
    ) {
        self.sequence += 1;
        self.clear_search();

        let entry = match (&self.my_files, self.collaborators.volumes.location_info(&entry)) {
            (Some(my_files), Some(location))
                if location.root_type == RootType::Downloads && location.is_root_entry =>
            {
                my_files.clone()
            }
            _ => entry,
        };

        if let Some(current) = self.arena.current_mut() {
            current.cancel_scan();
        }
        self.enqueue(DirTask::Change { entry, reply });
    }

    fn activate_directory_entry(
        &mut self,
        entry: Entry,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
    ) {
        if self.current_dir_entry() == Some(&entry) {
            self.clear_selection();
            if let Some(reply) = reply {
                let _ = reply.send(ChangeOutcome::AlreadyCurrent);
            }
        } else {
            self.change_directory_entry(entry, reply);
        }
    }

    fn enqueue(&mut self, task: DirTask) {
        let next = self.queue.push(self.sequence, task);
        self.drive_queue(next);
    }

    fn finish_queue_task(&mut self) {
        let next = self.queue.complete();
        self.drive_queue(next);
    }

    /// Start queued tasks until one of them stays in flight.
    fn drive_queue(&mut self, mut next: Option<Sequenced<DirTask>>) {
        while let Some(task) = next {
            if self.start_task(task) {
                return;
            }
            next = self.queue.complete();
        }
    }

    /// Returns `true` while the task is still running asynchronously.
    fn start_task(&mut self, task: Sequenced<DirTask>) -> bool {
        let stale = task.is_stale(self.sequence);
        let sequence = task.sequence;
        match task.task {
            DirTask::Change { entry, reply } => {
                if stale {
                    debug!(directory = %entry, "Skipping superseded directory change");
                    if let Some(reply) = reply {
                        let _ = reply.send(ChangeOutcome::Superseded);
                    }
                    return false;
                }
                let watcher = self.collaborators.watcher.clone();
                let sink = self.watcher_sink.clone();
                self.spawn_work(async move {
                    if let Err(e) = watcher.change_watched_directory(&entry, sink).await {
                        warn!(directory = %entry, error = %e, "Failed to watch directory");
                    }
                    ModelMessage::WatcherReady {
                        sequence,
                        entry,
                        reply,
                    }
                });
                true
            }
            DirTask::Search { query, callbacks } => {
                if stale {
                    return false;
                }
                self.start_search(query, callbacks)
            }
        }
    }

    fn on_watcher_ready(
        &mut self,
        sequence: u64,
        entry: Entry,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
    ) {
        if sequence != self.sequence {
            debug!(directory = %entry, "Directory change superseded while resubscribing");
            if let Some(reply) = reply {
                let _ = reply.send(ChangeOutcome::Superseded);
            }
            self.finish_queue_task();
            return;
        }

        let Some(contents) = self.create_directory_contents(&entry, "") else {
            warn!(directory = %entry, "No contents can be created for directory");
            if let Some(reply) = reply {
                let _ = reply.send(ChangeOutcome::Unresolvable);
            }
            self.finish_queue_task();
            return;
        };

        let previous = self.current_dir_entry().cloned();
        self.clear_and_scan(contents, reply);

        let volumes = &self.collaborators.volumes;
        let previous_volume = previous.as_ref().and_then(|p| volumes.volume_info(p));
        let current_volume = volumes.volume_info(&entry);
        info!(directory = %entry, "Directory changed");
        self.emit(ModelEvent::DirectoryChanged {
            previous,
            volume_changed: previous_volume.map(|v| v.id) != current_volume.map(|v| v.id),
            current: entry,
        });
    }

    // ---- Search ----

    fn search(&mut self, query: String, callbacks: SearchCallbacks) {
        self.last_search_query = query.clone();
        self.clear_search();
        if self.current_dir_entry().is_none() {
            return;
        }

        self.sequence += 1;
        if let Some(current) = self.arena.current_mut() {
            current.cancel_scan();
        }
        self.enqueue(DirTask::Search { query, callbacks });
    }

    fn start_search(&mut self, query: String, callbacks: SearchCallbacks) -> bool {
        let Some(directory) = self.current_dir_entry().cloned() else {
            return false;
        };

        if query.trim_start().is_empty() {
            if !self.is_searching() {
                return false;
            }
            let Some(contents) = self.create_directory_contents(&directory, "") else {
                return false;
            };
            self.clear_and_scan(contents, None);
            return true;
        }

        let Some(contents) = self.create_directory_contents(&directory, &query) else {
            return false;
        };
        debug!(query = %query, directory = %directory, "Starting search");
        self.search_callbacks = Some(callbacks);
        self.clear_and_scan(contents, None);
        true
    }

    /// Drop the active search state and tell its owner, once.
    fn clear_search(&mut self) {
        if !self.is_searching() {
            return;
        }
        if let Some(callbacks) = self.search_callbacks.take() {
            if let Some(on_clear) = callbacks.on_clear {
                on_clear();
            }
        }
    }

    // ---- Contents construction ----

    fn create_directory_contents(&mut self, entry: &Entry, query: &str) -> Option<DirectoryContents> {
        let query = query.trim_start();
        let volumes = &self.collaborators.volumes;
        let location = volumes.location_info(entry);
        let search_root = location.as_ref().map(|l| l.volume.root.clone());
        let can_use_drive_search = !volumes.drive_connection_offline()
            && location.as_ref().map(|l| l.is_drive_based).unwrap_or(false);

        let (scan_target, source, search_root) = match entry.fake_root() {
            Some(RootType::Recent) => {
                let root = volumes.default_display_root();
                let search_root = root.as_ref().map(|r| r.path().to_path_buf());
                (entry.clone(), ScanSource::Recent(query.to_string()), search_root)
            }
            Some(RootType::MyFiles) => {
                let root = volumes.default_display_root()?;
                let search_root = Some(root.path().to_path_buf());
                (root, ScanSource::Directory, search_root)
            }
            Some(RootType::DriveFakeRoot) => (entry.clone(), ScanSource::FakeRoot, None),
            _ if !query.is_empty() && can_use_drive_search => (
                entry.clone(),
                ScanSource::RemoteSearch(query.to_string()),
                search_root,
            ),
            _ if !query.is_empty() => (
                entry.clone(),
                ScanSource::LocalSearch(query.to_string()),
                search_root,
            ),
            _ => {
                let location = location?;
                let source = if location.root_type == RootType::MediaView {
                    ScanSource::MediaView
                } else if location.is_special_search_root {
                    ScanSource::MetadataSearch(match location.root_type {
                        RootType::DriveOffline => MetadataSearchType::Offline,
                        RootType::DriveSharedWithMe => MetadataSearchType::SharedWithMe,
                        RootType::DriveRecent => MetadataSearchType::RecentFiles,
                        other => {
                            warn!(root_type = other.as_str(), "Unknown special search root");
                            return None;
                        }
                    })
                } else {
                    ScanSource::Directory
                };
                (entry.clone(), source, search_root)
            }
        };

        let id = self.arena.allocate_id();
        Some(DirectoryContents::new(
            id,
            entry.clone(),
            scan_target,
            source,
            search_root,
        ))
    }

    // ---- Scanning ----

    /// Swap in `contents` as the visible listing and scan it from scratch.
    fn clear_and_scan(
        &mut self,
        contents: DirectoryContents,
        reply: Option<oneshot::Sender<ChangeOutcome>>,
    ) {
        if let Some(current) = self.arena.current_mut() {
            current.cancel_scan();
        }
        let id = contents.id();
        let directory = contents.directory_entry().clone();
        let previous = self.arena.replace_current(contents);

        self.rescan_timer.clear();
        self.pending_rescan = false;
        self.scan_failures = 0;
        if let Some(running) = self.running_scan.take() {
            if let Some(contents) = self.arena.get_mut(running) {
                contents.cancel_scan();
            }
            self.arena.remove(running);
            self.abandon_scan(running);
        }

        if let Some(previous) = previous {
            self.collaborators
                .metadata
                .notify_entries_removed(&previous.file_list().urls());
        }
        if !directory.is_fake() {
            let metadata = self.collaborators.metadata.clone();
            let target = directory.clone();
            self.spawn_work(async move {
                metadata.get(std::slice::from_ref(&target), false).await;
                ModelMessage::Prefetched
            });
        }

        self.update_selection(|selection, _| {
            selection.clear();
            false
        });
        self.emit(ModelEvent::ScanStarted {
            directory: directory.clone(),
        });

        let purpose = ScanPurpose::Navigate {
            sequence: self.sequence,
            reply,
            settled: false,
        };
        self.start_scan(id, false, purpose);
    }

    fn start_scan(&mut self, id: ContentsId, refresh: bool, purpose: ScanPurpose) {
        let Some(contents) = self.arena.get_mut(id) else {
            return;
        };
        self.running_scan = Some(id);
        self.scans.insert(id, ScanRecord { purpose, refresh });
        contents.scan(
            refresh,
            self.collaborators.scanner.clone(),
            self.collaborators.metadata.clone(),
            self.scan_sink.clone(),
        );
    }

    /// Forget a scan whose results no longer matter.
    fn abandon_scan(&mut self, id: ContentsId) {
        self.deferred.retain(|d| d.after != id);
        let Some(record) = self.scans.remove(&id) else {
            return;
        };
        if let ScanPurpose::Navigate {
            reply: Some(reply),
            settled: false,
            ..
        } = record.purpose
        {
            let _ = reply.send(ChangeOutcome::Cancelled);
        }
    }

    fn handle_scan_event(&mut self, id: ContentsId, event: ScanEvent) {
        match event {
            ScanEvent::Updated(batch) => self.on_scan_updated(id, batch),
            ScanEvent::Completed => self.on_scan_completed(id),
            ScanEvent::Failed(error) => self.on_scan_failed(id, error),
            ScanEvent::Cancelled => self.on_scan_cancelled(id),
        }
    }

    fn on_scan_updated(&mut self, id: ContentsId, batch: Vec<Entry>) {
        let Some(record) = self.scans.get_mut(&id) else {
            return;
        };
        let batch = self.filter.apply(batch);

        match &mut record.purpose {
            ScanPurpose::Navigate {
                sequence,
                reply,
                settled,
            } => {
                if *settled {
                    return;
                }
                if *sequence != self.sequence {
                    *settled = true;
                    if let Some(reply) = reply.take() {
                        let _ = reply.send(ChangeOutcome::Superseded);
                    }
                    let directory = self.contents_entry(id);
                    if let Some(directory) = directory {
                        self.emit(ModelEvent::ScanCancelled { directory });
                    }
                    self.post(ModelMessage::QueueTaskDone);
                    return;
                }
                if let Some(contents) = self.arena.get_mut(id) {
                    contents.file_list_mut().upsert(batch);
                    let directory = contents.directory_entry().clone();
                    self.emit(ModelEvent::ScanUpdated { directory });
                }
            }
            ScanPurpose::Rescan { .. } | ScanPurpose::PartialUpdate => {
                if let Some(contents) = self.arena.get_mut(id) {
                    contents.file_list_mut().upsert(batch);
                }
            }
        }
    }

    /// Take the record for a terminal event, releasing the running slot.
    fn settle_scan(&mut self, id: ContentsId, status: ScanStatus) -> Option<ScanRecord> {
        let record = self.scans.remove(&id);
        if self.running_scan == Some(id) {
            self.running_scan = None;
        }
        if let Some(contents) = self.arena.get_mut(id) {
            contents.finish(status);
        }
        record
    }

    fn on_scan_completed(&mut self, id: ContentsId) {
        let Some(record) = self.settle_scan(id, ScanStatus::Completed) else {
            return;
        };
        let directory = self.contents_entry(id);

        match record.purpose {
            ScanPurpose::Navigate {
                reply, settled, ..
            } => {
                if !settled {
                    if let Some(directory) = directory.clone() {
                        info!(directory = %directory, "Scan completed");
                        self.emit(ModelEvent::ScanCompleted { directory });
                    }
                    if let Some(on_rescan) = self
                        .search_callbacks
                        .as_mut()
                        .and_then(|c| c.on_rescan.as_mut())
                    {
                        on_rescan();
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(ChangeOutcome::Loaded);
                    }
                    self.post(ModelMessage::QueueTaskDone);
                }
            }
            ScanPurpose::Rescan { sequence } => {
                if sequence == self.sequence {
                    self.replace_directory_contents(id);
                    if let Some(directory) = directory.clone() {
                        self.emit(ModelEvent::RescanCompleted { directory });
                    }
                } else {
                    self.arena.remove(id);
                }
            }
            ScanPurpose::PartialUpdate => {
                if let Some(directory) = directory.clone() {
                    self.emit(ModelEvent::RescanCompleted { directory });
                }
                self.replay_deferred(id);
                self.maybe_run_pending_rescan(record.refresh);
                return;
            }
        }

        self.scan_failures = 0;
        self.replay_deferred(id);
        self.maybe_run_pending_rescan(record.refresh);
    }

    fn on_scan_failed(&mut self, id: ContentsId, error: ScanError) {
        let Some(record) = self.settle_scan(id, ScanStatus::Failed) else {
            return;
        };
        self.deferred.retain(|d| d.after != id);
        let directory = self.contents_entry(id);

        if let ScanPurpose::PartialUpdate = record.purpose {
            debug!(error = %error, "Partial update failed");
            return;
        }

        self.scan_failures += 1;
        let retry = if self.pending_rescan {
            Retry::Pending
        } else if error.is_volume_disconnected() {
            Retry::Never
        } else if self.scan_failures <= self.config.max_auto_retries {
            Retry::Later
        } else {
            Retry::Never
        };
        let will_retry = retry != Retry::Never;
        warn!(
            error = %error,
            failures = self.scan_failures,
            will_retry,
            "Scan failed"
        );

        match record.purpose {
            ScanPurpose::Navigate { reply, settled, .. } => {
                if !settled {
                    if let Some(directory) = directory {
                        self.emit(ModelEvent::ScanFailed {
                            directory,
                            error: error.clone(),
                            will_retry,
                        });
                    }
                    if let Some(reply) = reply {
                        let _ = reply.send(ChangeOutcome::Failed(error));
                    }
                    self.post(ModelMessage::QueueTaskDone);
                }
            }
            ScanPurpose::Rescan { .. } => {
                self.arena.remove(id);
                if let Some(directory) = directory {
                    self.emit(ModelEvent::RescanFailed {
                        directory,
                        error,
                        will_retry,
                    });
                }
            }
            ScanPurpose::PartialUpdate => {}
        }

        match retry {
            Retry::Pending => {
                self.maybe_run_pending_rescan(record.refresh);
            }
            Retry::Later => {
                info!("Retrying failed scan");
                self.rescan_later(record.refresh);
            }
            Retry::Never => {}
        }
    }

    fn on_scan_cancelled(&mut self, id: ContentsId) {
        let Some(record) = self.settle_scan(id, ScanStatus::Cancelled) else {
            return;
        };
        self.deferred.retain(|d| d.after != id);
        let directory = self.contents_entry(id);

        match record.purpose {
            ScanPurpose::Navigate {
                sequence,
                reply,
                settled,
            } => {
                if !settled {
                    if let Some(directory) = directory {
                        debug!(directory = %directory, "Scan cancelled");
                        self.emit(ModelEvent::ScanCancelled { directory });
                    }
                    if let Some(reply) = reply {
                        let outcome = if sequence == self.sequence {
                            ChangeOutcome::Cancelled
                        } else {
                            ChangeOutcome::Superseded
                        };
                        let _ = reply.send(outcome);
                    }
                    self.post(ModelMessage::QueueTaskDone);
                }
            }
            ScanPurpose::Rescan { .. } => {
                self.arena.remove(id);
            }
            ScanPurpose::PartialUpdate => {}
        }
    }

    fn contents_entry(&self, id: ContentsId) -> Option<Entry> {
        self.arena.get(id).map(|c| c.directory_entry().clone())
    }

    /// Swap the finished shadow `id` in as the visible contents, carrying
    /// the selection over by identity.
    fn replace_directory_contents(&mut self, id: ContentsId) {
        self.emit(ModelEvent::BeginUpdateFiles);

        self.selection.begin_change();
        let empty = FileList::new();
        let snapshot = SelectionSnapshot::capture(
            &self.selection,
            self.arena.current().map(|c| c.file_list()).unwrap_or(&empty),
        );
        self.arena.promote(id);
        let force = snapshot.restore(
            &mut self.selection,
            self.arena.current().map(|c| c.file_list()).unwrap_or(&empty),
        );
        let changed = self.selection.end_change();
        if changed || force {
            self.emit(ModelEvent::SelectionChanged);
        }

        self.emit(ModelEvent::EndUpdateFiles);
    }

    // ---- Rescans ----

    fn rescan(&mut self, refresh: bool) {
        self.rescan_timer.clear();
        if self.running_scan.is_some() {
            self.pending_rescan = true;
            return;
        }
        if self.arena.current().is_none() {
            return;
        }
        let id = self.arena.allocate_id();
        let Some(shadow) = self.arena.current().map(|c| c.clone_detached(id)) else {
            return;
        };
        debug!(directory = %shadow.directory_entry(), refresh, "Rescanning");
        self.arena.insert(shadow);
        self.start_scan(
            id,
            refresh,
            ScanPurpose::Rescan {
                sequence: self.sequence,
            },
        );
    }

    fn rescan_soon(&mut self, refresh: bool) {
        self.schedule_rescan(self.config.short_interval, refresh);
    }

    fn rescan_later(&mut self, refresh: bool) {
        self.schedule_rescan(self.config.coalesce_interval, refresh);
    }

    fn schedule_rescan(&mut self, delay: Duration, refresh: bool) {
        let inbox = self.inbox.clone();
        self.rescan_timer
            .schedule(delay, refresh, self.sequence, move |id| {
                let _ = inbox.send(Envelope {
                    message: ModelMessage::RescanTimer(id),
                    tracked: false,
                });
            });
    }

    fn maybe_run_pending_rescan(&mut self, refresh: bool) -> bool {
        if !self.pending_rescan {
            return false;
        }
        self.pending_rescan = false;
        self.rescan_soon(refresh);
        true
    }

    fn run_aggregator(&mut self) {
        let inbox = self.inbox.clone();
        let run = self.aggregator.run(move |id| {
            let _ = inbox.send(Envelope {
                message: ModelMessage::AggregatorTimer(id),
                tracked: false,
            });
        });
        if run == AggregatorRun::RunNow {
            self.rescan_soon(true);
        }
    }

    // ---- Partial updates ----

    /// Apply a delta to the visible list.
    ///
    /// Dropped when a rescan is already pending, deferred until completion
    /// when a scan is running, applied at once otherwise.
    fn partial_update(&mut self, changed: Vec<Entry>, removed: Vec<String>) {
        if self.pending_rescan {
            debug!("Dropping partial update, a rescan is pending");
            return;
        }
        if let Some(running) = self.running_scan {
            self.deferred.push(DeferredUpdate {
                after: running,
                changed,
                removed,
            });
            return;
        }
        let Some(current_id) = self.arena.current_id() else {
            return;
        };

        let changed = self.filter.apply(changed);
        self.running_scan = Some(current_id);
        self.scans.insert(
            current_id,
            ScanRecord {
                purpose: ScanPurpose::PartialUpdate,
                refresh: false,
            },
        );
        self.collaborators.metadata.notify_entries_removed(&removed);

        self.selection.begin_change();
        let metadata = self.collaborators.metadata.clone();
        let sink = self.scan_sink.clone();
        if let Some(contents) = self.arena.get_mut(current_id) {
            let snapshot = SelectionSnapshot::capture(&self.selection, contents.file_list());
            contents.update(changed, &removed, metadata, sink);
            snapshot.restore_identity(&mut self.selection, contents.file_list());
        }
        if self.selection.end_change() {
            self.emit(ModelEvent::SelectionChanged);
        }
    }

    fn replay_deferred(&mut self, id: ContentsId) {
        let (ready, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.deferred).into_iter().partition(|d| d.after == id);
        self.deferred = waiting;
        for update in ready {
            self.post(ModelMessage::ReplayPartialUpdate {
                changed: update.changed,
                removed: update.removed,
            });
        }
    }

    // ---- External notifications ----

    fn on_watcher_event(&mut self, event: WatcherEvent) {
        if self.disposed {
            return;
        }
        let Some(current) = self.current_dir_entry().cloned() else {
            return;
        };
        if event.directory != current {
            debug!(directory = %event.directory, "Ignoring change for a directory no longer shown");
            return;
        }

        if !self.ignore_current_directory_deletion {
            let volumes = self.collaborators.volumes.clone();
            let directory = current.clone();
            self.spawn_work(async move {
                let exists = volumes.directory_exists(&directory).await;
                ModelMessage::DirectoryChecked { directory, exists }
            });
        }

        let Some(changes) = event.changes else {
            self.run_aggregator();
            return;
        };

        let mut deleted = Vec::new();
        let mut to_resolve = Vec::new();
        for change in changes {
            match change.change_type {
                ChangeType::Delete => deleted.push(change.url),
                ChangeType::AddOrUpdate => to_resolve.push(change.url),
            }
        }
        let volumes = self.collaborators.volumes.clone();
        self.spawn_work(async move {
            let resolved = volumes.resolve_urls(to_resolve).await;
            ModelMessage::UrlsResolved {
                directory: current,
                resolved,
                deleted,
            }
        });
    }

    fn on_entries_changed(&mut self, kind: EntriesChangedKind, entries: Vec<Entry>) {
        let on_drive = self.current_root_type().map(|r| r.is_drive()).unwrap_or(false);
        if on_drive && self.is_searching() {
            return;
        }

        match kind {
            EntriesChangedKind::Created => {
                let Some(current) = self.current_dir_entry().cloned() else {
                    return;
                };
                let mut to_add = Vec::new();
                for entry in entries {
                    if entry.parent().as_ref() != Some(&current) {
                        continue;
                    }
                    let existing = self
                        .arena
                        .current()
                        .and_then(|c| c.file_list().index_of(entry.url()));
                    match (existing, self.arena.current_mut()) {
                        (Some(index), Some(contents)) => {
                            contents.file_list_mut().replace_at(index, entry)
                        }
                        _ => to_add.push(entry),
                    }
                }
                if !to_add.is_empty() {
                    self.partial_update(to_add, Vec::new());
                }
            }
            EntriesChangedKind::Deleted => {
                self.partial_update(Vec::new(), entries_to_urls(&entries));
            }
        }
    }

    fn on_rename_entry(&mut self, old: Entry, new: Entry, reply: Option<oneshot::Sender<()>>) {
        let metadata = self.collaborators.metadata.clone();
        self.spawn_work(async move {
            metadata.get(std::slice::from_ref(&new), true).await;
            ModelMessage::RenamePrefetched { old, new, reply }
        });
    }

    fn apply_rename(&mut self, old: Entry, new: Entry) {
        if self.current_dir_entry() == Some(&old) {
            self.change_directory_entry(new.clone(), None);
        }
        let Some(contents) = self.arena.current_mut() else {
            return;
        };
        let list = contents.file_list_mut();
        // Renaming onto a listed URL drops a row, so selection is remapped by URL.
        let shifts = old.url() != new.url() && list.contains(new.url());
        let snapshot = shifts.then(|| {
            self.selection.begin_change();
            SelectionSnapshot::capture(&self.selection, list)
        });
        match list.index_of(old.url()) {
            Some(index) => list.replace_at(index, new),
            None if !list.contains(new.url()) => list.upsert(vec![new]),
            None => {}
        }
        if let Some(snapshot) = snapshot {
            snapshot.restore_identity(&mut self.selection, list);
            if self.selection.end_change() {
                self.emit(ModelEvent::SelectionChanged);
            }
        }
    }

    fn update_and_select_new_directory(&mut self, entry: Entry, reply: oneshot::Sender<Result<()>>) {
        self.collaborators
            .metadata
            .notify_entries_created(std::slice::from_ref(&entry));
        let metadata = self.collaborators.metadata.clone();
        let sequence = self.sequence;
        self.spawn_work(async move {
            metadata.get(std::slice::from_ref(&entry), false).await;
            ModelMessage::NewDirectoryPrefetched {
                sequence,
                entry,
                reply,
            }
        });
    }

    fn select_new_directory(&mut self, entry: Entry) {
        let Some(contents) = self.arena.current_mut() else {
            return;
        };
        let list = contents.file_list_mut();
        let index = match list.entries().iter().position(|e| e.name() == entry.name()) {
            Some(index) => index,
            None => {
                list.insert(0, entry);
                0
            }
        };
        self.select_index(index);
    }

    fn set_show_hidden(&mut self, show: bool) {
        self.filter.set_show_hidden(show);
        let Some(current) = self.current_dir_entry().cloned() else {
            return;
        };
        if !current.is_fake() && !self.filter.is_visible(&current) {
            if let Some(volume) = self.collaborators.volumes.volume_info(&current) {
                self.change_directory_entry(volume.display_root(), None);
                return;
            }
        }
        self.rescan_soon(false);
    }

    fn on_volumes_changed(&mut self, added: Vec<VolumeInfo>, removed: Vec<VolumeInfo>) {
        if self.current_unmounted(&removed) {
            if let Some(root) = self.collaborators.volumes.default_display_root() {
                info!(directory = %root, "Current volume unmounted");
                self.change_directory_entry(root, None);
            }
            return;
        }

        match self.current_root_type() {
            Some(RootType::MyFiles) => {
                if added.iter().any(|v| {
                    matches!(
                        v.volume_type,
                        VolumeType::Downloads | VolumeType::Android | VolumeType::Crostini
                    )
                }) {
                    self.rescan(false);
                }
            }
            Some(RootType::DriveFakeRoot) => {
                if let Some(drive) = added.iter().find(|v| v.volume_type == VolumeType::Drive) {
                    self.change_directory_entry(drive.display_root(), None);
                }
            }
            Some(RootType::Crostini) => {
                if let [volume] = added.as_slice() {
                    if volume.volume_type == VolumeType::Crostini {
                        self.change_directory_entry(volume.display_root(), None);
                    }
                }
            }
            _ => {}
        }
    }

    fn current_unmounted(&self, removed: &[VolumeInfo]) -> bool {
        let Some(current) = self.current_dir_entry() else {
            return false;
        };
        match current.fake_root() {
            None => self.collaborators.volumes.volume_info(current).is_none(),
            Some(root) if root.is_drive() => removed
                .iter()
                .any(|v| v.volume_type == VolumeType::Drive),
            Some(_) => false,
        }
    }

    // ---- Selection ----

    /// Run `update` inside a change bracket and publish the result.
    /// `update` returns `true` to force a change notification.
    fn update_selection<F>(&mut self, update: F)
    where
        F: FnOnce(&mut SelectionModel, &FileList) -> bool,
    {
        let empty = FileList::new();
        let list = self.arena.current().map(|c| c.file_list()).unwrap_or(&empty);
        self.selection.begin_change();
        let force = update(&mut self.selection, list);
        let changed = self.selection.end_change();
        if changed || force {
            self.emit(ModelEvent::SelectionChanged);
        }
    }

    fn clear_selection(&mut self) {
        self.update_selection(|selection, _| {
            selection.unselect_all();
            false
        });
    }

    fn select_entry(&mut self, entry: &Entry) {
        let index = self
            .arena
            .current()
            .and_then(|c| c.file_list().index_of(entry.url()));
        if let Some(index) = index {
            self.select_index(index);
        }
    }

    fn select_entries(&mut self, entries: &[Entry]) {
        let urls: HashSet<&str> = entries.iter().map(Entry::url).collect();
        self.update_selection(|selection, list| {
            selection.unselect_all();
            for (index, entry) in list.entries().iter().enumerate() {
                if urls.contains(entry.url()) {
                    selection.set_index_selected(index, true);
                }
            }
            false
        });
    }

    fn select_index(&mut self, index: usize) {
        self.update_selection(|selection, list| {
            if index < list.len() {
                selection.select_only(index);
            }
            false
        });
    }

    // ---- Queries ----

    fn current_dir_entry(&self) -> Option<&Entry> {
        self.arena.current().map(|c| c.directory_entry())
    }

    fn is_searching(&self) -> bool {
        self.arena.current().map(|c| c.is_search()).unwrap_or(false)
    }

    fn current_root_type(&self) -> Option<RootType> {
        let current = self.current_dir_entry()?;
        current.fake_root().or_else(|| {
            self.collaborators
                .volumes
                .location_info(current)
                .map(|l| l.root_type)
        })
    }

    fn snapshot(&self) -> ModelSnapshot {
        let current = self.arena.current();
        let directory = current.map(|c| c.directory_entry().clone());
        let volumes = &self.collaborators.volumes;
        let location = directory.as_ref().and_then(|d| volumes.location_info(d));
        let volume = directory.as_ref().and_then(|d| volumes.volume_info(d));

        ModelSnapshot {
            is_scanning: current.map(|c| c.is_scanning()).unwrap_or(false),
            is_searching: self.is_searching(),
            files: current
                .map(|c| c.file_list().entries().to_vec())
                .unwrap_or_default(),
            selected_indexes: self.selection.selected_indexes(),
            lead_index: self.selection.lead_index(),
            check_select_mode: self.selection.check_select_mode(),
            last_search_query: self.last_search_query.clone(),
            root_type: self.current_root_type(),
            is_read_only: location.as_ref().map(|l| l.is_read_only).unwrap_or(true),
            is_on_drive: volume
                .as_ref()
                .map(|v| v.volume_type == VolumeType::Drive)
                .unwrap_or(false),
            volume,
            current_directory: directory,
            sequence: self.sequence,
            scan_failures: self.scan_failures,
        }
    }

    // ---- Lifecycle ----

    fn is_idle(&self) -> bool {
        self.queue.is_idle()
            && self.running_scan.is_none()
            && self.scans.is_empty()
            && self.deferred.is_empty()
            && !self.rescan_timer.is_pending()
            && !self.aggregator.is_pending()
            && self.in_flight == 0
    }

    fn notify_idle(&mut self) {
        if self.idle_waiters.is_empty() || !self.is_idle() {
            return;
        }
        for waiter in self.idle_waiters.drain(..) {
            let _ = waiter.send(());
        }
    }

    fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.collaborators.watcher.stop();
        self.rescan_timer.clear();
        self.aggregator.clear();
        if let Some(current) = self.arena.current_mut() {
            current.cancel_scan();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Retry {
    /// A rescan requested during the scan runs instead.
    Pending,
    Later,
    Never,
}
