use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::ScanError;
use crate::fs::entry::Entry;
use crate::fs::metadata::MetadataModel;
use crate::fs::scanner::{ContentScanner, ScanRequest, ScanSource};

/// Generation id of a contents instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentsId(u64);

impl fmt::Display for ContentsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Idle,
    Scanning,
    Completed,
    Failed,
    Cancelled,
}

/// Progress of a scan or update, tagged with the contents it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    Updated(Vec<Entry>),
    Completed,
    Failed(ScanError),
    Cancelled,
}

impl ScanEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanEvent::Updated(_))
    }
}

pub type ScanEventSink = mpsc::UnboundedSender<(ContentsId, ScanEvent)>;

/// Ordered entries with an index by URL.
#[derive(Debug, Clone, Default)]
pub struct FileList {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
}

impl FileList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&Entry> {
        self.entries.get(index)
    }

    pub fn url_at(&self, index: usize) -> Option<&str> {
        self.entries.get(index).map(Entry::url)
    }

    pub fn index_of(&self, url: &str) -> Option<usize> {
        self.index.get(url).copied()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.index.contains_key(url)
    }

    /// Append entries, replacing any that are already listed.
    pub fn upsert(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            match self.index_of(entry.url()) {
                Some(i) => self.entries[i] = entry,
                None => {
                    self.index.insert(entry.url().to_string(), self.entries.len());
                    self.entries.push(entry);
                }
            }
        }
    }

    /// Remove entries by URL. Returns how many were removed.
    pub fn remove_urls(&mut self, urls: &[String]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| !urls.iter().any(|u| u == e.url()));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.reindex();
        }
        removed
    }

    pub fn insert(&mut self, index: usize, entry: Entry) {
        if self.contains(entry.url()) {
            return;
        }
        let index = index.min(self.entries.len());
        self.entries.insert(index, entry);
        self.reindex();
    }

    /// Replace the entry at `index` in place. If the new URL is already
    /// listed at another index, that row takes the entry and the row at
    /// `index` is dropped.
    pub fn replace_at(&mut self, index: usize, entry: Entry) {
        if index >= self.entries.len() {
            return;
        }
        match self.index_of(entry.url()) {
            Some(existing) if existing != index => {
                self.entries[existing] = entry;
                self.entries.remove(index);
                self.reindex();
            }
            _ => {
                self.index.remove(self.entries[index].url());
                self.index.insert(entry.url().to_string(), index);
                self.entries[index] = entry;
            }
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.index.clear();
    }

    pub fn urls(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.url().to_string()).collect()
    }

    fn reindex(&mut self) {
        self.index = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.url().to_string(), i))
            .collect();
    }
}

/// One enumeration attempt and the list it fills.
#[derive(Debug)]
pub struct DirectoryContents {
    id: ContentsId,
    entry: Entry,
    /// What actually gets enumerated. Differs from `entry` for roots that
    /// stand in for another directory.
    scan_target: Entry,
    source: ScanSource,
    search_root: Option<PathBuf>,
    status: ScanStatus,
    list: FileList,
    cancel: CancelToken,
}

impl DirectoryContents {
    pub fn new(
        id: ContentsId,
        entry: Entry,
        scan_target: Entry,
        source: ScanSource,
        search_root: Option<PathBuf>,
    ) -> Self {
        Self {
            id,
            entry,
            scan_target,
            source,
            search_root,
            status: ScanStatus::Idle,
            list: FileList::new(),
            cancel: CancelToken::new(),
        }
    }

    pub fn id(&self) -> ContentsId {
        self.id
    }

    pub fn directory_entry(&self) -> &Entry {
        &self.entry
    }

    pub fn source(&self) -> &ScanSource {
        &self.source
    }

    pub fn status(&self) -> ScanStatus {
        self.status
    }

    pub fn is_scanning(&self) -> bool {
        self.status == ScanStatus::Scanning
    }

    pub fn is_search(&self) -> bool {
        self.source.is_search()
    }

    pub fn file_list(&self) -> &FileList {
        &self.list
    }

    pub fn file_list_mut(&mut self) -> &mut FileList {
        &mut self.list
    }

    /// Record the terminal status reported for the running scan.
    pub fn finish(&mut self, status: ScanStatus) {
        self.status = status;
    }

    /// Start enumerating. Results arrive on `sink` tagged with this
    /// contents' id: zero or more `Updated`, then exactly one terminal event.
    pub fn scan(
        &mut self,
        refresh: bool,
        scanner: Arc<dyn ContentScanner>,
        metadata: Arc<dyn MetadataModel>,
        sink: ScanEventSink,
    ) {
        self.status = ScanStatus::Scanning;
        self.cancel = CancelToken::new();

        let id = self.id;
        let cancel = self.cancel.clone();
        let request = ScanRequest {
            entry: self.scan_target.clone(),
            source: self.source.clone(),
            search_root: self.search_root.clone(),
            refresh,
        };

        tokio::spawn(async move {
            let (batch_tx, mut batch_rx) = mpsc::unbounded_channel();
            let scan_cancel = cancel.clone();
            let scan = tokio::spawn(async move {
                scanner.scan(&request, batch_tx, &scan_cancel).await
            });

            while let Some(batch) = batch_rx.recv().await {
                if cancel.is_cancelled() {
                    continue;
                }
                metadata.get(&batch, refresh).await;
                if sink.send((id, ScanEvent::Updated(batch))).is_err() {
                    cancel.cancel();
                }
            }

            let result = scan.await.unwrap_or_else(|e| {
                Err(ScanError::Io {
                    path: PathBuf::new(),
                    message: e.to_string(),
                })
            });
            let terminal = match result {
                Ok(()) => ScanEvent::Completed,
                Err(ScanError::Cancelled) => ScanEvent::Cancelled,
                Err(_) if cancel.is_cancelled() => ScanEvent::Cancelled,
                Err(e) => ScanEvent::Failed(e),
            };
            debug!(contents = %id, ?terminal, "Scan finished");
            let _ = sink.send((id, terminal));
        });
    }

    /// Apply an incremental delta. `removed_urls` leave the list at once;
    /// `changed` comes back as an `Updated` batch after its metadata is
    /// prefetched, followed by `Completed`.
    pub fn update(
        &mut self,
        changed: Vec<Entry>,
        removed_urls: &[String],
        metadata: Arc<dyn MetadataModel>,
        sink: ScanEventSink,
    ) {
        self.list.remove_urls(removed_urls);
        self.status = ScanStatus::Scanning;
        self.cancel = CancelToken::new();

        let id = self.id;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            metadata.get(&changed, true).await;
            if cancel.is_cancelled() {
                let _ = sink.send((id, ScanEvent::Cancelled));
                return;
            }
            let _ = sink.send((id, ScanEvent::Updated(changed)));
            let _ = sink.send((id, ScanEvent::Completed));
        });
    }

    /// Ask the running scan to stop. It still reports a terminal event.
    pub fn cancel_scan(&mut self) {
        if self.is_scanning() {
            self.cancel.cancel();
        }
    }

    /// A copy targeting the same location with a fresh, empty list.
    pub fn clone_detached(&self, id: ContentsId) -> Self {
        Self::new(
            id,
            self.entry.clone(),
            self.scan_target.clone(),
            self.source.clone(),
            self.search_root.clone(),
        )
    }
}

/// Owns every live contents instance and tracks which one is visible.
#[derive(Debug, Default)]
pub struct ContentsArena {
    slots: HashMap<ContentsId, DirectoryContents>,
    current: Option<ContentsId>,
    next_id: u64,
}

impl ContentsArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_id(&mut self) -> ContentsId {
        self.next_id += 1;
        ContentsId(self.next_id)
    }

    pub fn insert(&mut self, contents: DirectoryContents) {
        self.slots.insert(contents.id(), contents);
    }

    pub fn get(&self, id: ContentsId) -> Option<&DirectoryContents> {
        self.slots.get(&id)
    }

    pub fn get_mut(&mut self, id: ContentsId) -> Option<&mut DirectoryContents> {
        self.slots.get_mut(&id)
    }

    pub fn remove(&mut self, id: ContentsId) -> Option<DirectoryContents> {
        if self.current == Some(id) {
            return None;
        }
        self.slots.remove(&id)
    }

    pub fn current_id(&self) -> Option<ContentsId> {
        self.current
    }

    pub fn current(&self) -> Option<&DirectoryContents> {
        self.slots.get(&self.current?)
    }

    pub fn current_mut(&mut self) -> Option<&mut DirectoryContents> {
        let id = self.current?;
        self.slots.get_mut(&id)
    }

    /// Install `contents` as the visible instance, returning the one it
    /// replaced.
    pub fn replace_current(&mut self, contents: DirectoryContents) -> Option<DirectoryContents> {
        let id = contents.id();
        self.slots.insert(id, contents);
        self.promote(id)
    }

    /// Make an already stored instance visible, returning the previous one.
    pub fn promote(&mut self, id: ContentsId) -> Option<DirectoryContents> {
        if !self.slots.contains_key(&id) {
            return None;
        }
        let previous = self.current.replace(id)?;
        if previous == id {
            return None;
        }
        self.slots.remove(&previous)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::testing::{FakeMetadata, ScriptedScanner};

    fn entry(name: &str) -> Entry {
        Entry::file("local", format!("/docs/{}", name))
    }

    fn contents(arena: &mut ContentsArena) -> DirectoryContents {
        let dir = Entry::directory("local", "/docs");
        DirectoryContents::new(
            arena.allocate_id(),
            dir.clone(),
            dir,
            ScanSource::Directory,
            None,
        )
    }

    #[test]
    fn file_list_upsert_and_remove() {
        let mut list = FileList::new();
        list.upsert(vec![entry("a"), entry("b"), entry("c")]);
        list.upsert(vec![entry("b")]);
        assert_eq!(list.len(), 3);
        assert_eq!(list.index_of(entry("c").url()), Some(2));

        assert_eq!(list.remove_urls(&[entry("a").url().to_string()]), 1);
        assert_eq!(list.index_of(entry("c").url()), Some(1));
        assert!(!list.contains(entry("a").url()));
    }

    #[test]
    fn file_list_replace_keeps_position() {
        let mut list = FileList::new();
        list.upsert(vec![entry("a"), entry("b")]);
        list.replace_at(0, entry("c"));
        assert_eq!(list.url_at(0), Some(entry("c").url()));
        assert!(!list.contains(entry("a").url()));
        assert_eq!(list.index_of(entry("c").url()), Some(0));
    }

    #[test]
    fn file_list_replace_onto_listed_url_keeps_urls_unique() {
        let mut list = FileList::new();
        list.upsert(vec![entry("a"), entry("b"), entry("c")]);
        list.replace_at(0, entry("c"));
        assert_eq!(list.urls(), vec![entry("b").url(), entry("c").url()]);
        assert_eq!(list.index_of(entry("c").url()), Some(1));
        assert!(!list.contains(entry("a").url()));
    }

    #[test]
    fn file_list_replace_with_same_url_updates_in_place() {
        let mut list = FileList::new();
        list.upsert(vec![entry("a"), entry("b")]);
        list.replace_at(1, entry("b"));
        assert_eq!(list.len(), 2);
        assert_eq!(list.index_of(entry("b").url()), Some(1));
    }

    #[test]
    fn file_list_insert_shifts() {
        let mut list = FileList::new();
        list.upsert(vec![entry("a")]);
        list.insert(0, entry("z"));
        list.insert(0, entry("z"));
        assert_eq!(list.len(), 2);
        assert_eq!(list.index_of(entry("a").url()), Some(1));
    }

    #[test]
    fn arena_swaps_current() {
        let mut arena = ContentsArena::new();
        let first = contents(&mut arena);
        let first_id = first.id();
        assert!(arena.replace_current(first).is_none());

        let second = contents(&mut arena);
        let second_id = second.id();
        arena.insert(second);
        assert_eq!(arena.current_id(), Some(first_id));

        let old = arena.promote(second_id).unwrap();
        assert_eq!(old.id(), first_id);
        assert_eq!(arena.current_id(), Some(second_id));
        assert_eq!(arena.len(), 1);
        assert!(arena.remove(second_id).is_none());
    }

    #[test]
    fn clone_detached_starts_empty() {
        let mut arena = ContentsArena::new();
        let mut original = contents(&mut arena);
        original.file_list_mut().upsert(vec![entry("a")]);
        let copy = original.clone_detached(arena.allocate_id());
        assert!(copy.file_list().is_empty());
        assert_eq!(copy.directory_entry(), original.directory_entry());
        assert_ne!(copy.id(), original.id());
        assert_eq!(copy.status(), ScanStatus::Idle);
    }

    #[tokio::test]
    async fn scan_reports_batches_then_completion() {
        let mut arena = ContentsArena::new();
        let mut c = contents(&mut arena);
        let scanner = Arc::new(ScriptedScanner::new());
        scanner.set_listing("/docs", vec![entry("a"), entry("b")]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        c.scan(false, scanner, Arc::new(FakeMetadata::default()), tx);
        assert!(c.is_scanning());

        let (id, first) = rx.recv().await.unwrap();
        assert_eq!(id, c.id());
        assert_eq!(first, ScanEvent::Updated(vec![entry("a"), entry("b")]));
        assert_eq!(rx.recv().await.unwrap().1, ScanEvent::Completed);
    }

    #[tokio::test]
    async fn cancelled_scan_still_terminates() {
        let mut arena = ContentsArena::new();
        let mut c = contents(&mut arena);
        let scanner = Arc::new(ScriptedScanner::new());
        scanner.set_listing("/docs", vec![entry("a")]);
        scanner.gate("/docs");
        let (tx, mut rx) = mpsc::unbounded_channel();

        c.scan(false, scanner.clone(), Arc::new(FakeMetadata::default()), tx);
        c.cancel_scan();
        scanner.release("/docs");

        let (_, terminal) = rx.recv().await.unwrap();
        assert_eq!(terminal, ScanEvent::Cancelled);
    }

    #[tokio::test]
    async fn failed_scan_reports_error() {
        let mut arena = ContentsArena::new();
        let mut c = contents(&mut arena);
        let scanner = Arc::new(ScriptedScanner::new());
        scanner.fail("/docs", ScanError::PermissionDenied("/docs".into()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        c.scan(false, scanner, Arc::new(FakeMetadata::default()), tx);
        let (_, terminal) = rx.recv().await.unwrap();
        assert_eq!(
            terminal,
            ScanEvent::Failed(ScanError::PermissionDenied("/docs".into()))
        );
    }

    #[tokio::test]
    async fn update_removes_then_reports_changes() {
        let mut arena = ContentsArena::new();
        let mut c = contents(&mut arena);
        c.file_list_mut().upsert(vec![entry("a"), entry("b")]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        c.update(
            vec![entry("c")],
            &[entry("a").url().to_string()],
            Arc::new(FakeMetadata::default()),
            tx,
        );
        assert_eq!(c.file_list().len(), 1);
        assert_eq!(rx.recv().await.unwrap().1, ScanEvent::Updated(vec![entry("c")]));
        assert_eq!(rx.recv().await.unwrap().1, ScanEvent::Completed);
    }
}
