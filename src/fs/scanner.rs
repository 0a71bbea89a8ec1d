use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::ScanError;
use crate::fs::entry::{Entry, EntryKind};
use crate::fs::metadata::EntryMetadata;
use crate::fs::watcher::should_ignore;

/// Drive metadata listings that stand in for a directory read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataSearchType {
    Offline,
    SharedWithMe,
    RecentFiles,
}

/// What a contents instance enumerates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanSource {
    Directory,
    MediaView,
    /// File-name search under the directory.
    LocalSearch(String),
    /// Search across the whole drive-backed volume.
    RemoteSearch(String),
    /// Recently modified files, optionally filtered by name.
    Recent(String),
    MetadataSearch(MetadataSearchType),
    /// Placeholder root with nothing to list.
    FakeRoot,
}

impl ScanSource {
    pub fn is_search(&self) -> bool {
        matches!(
            self,
            ScanSource::LocalSearch(_)
                | ScanSource::RemoteSearch(_)
                | ScanSource::Recent(_)
                | ScanSource::MetadataSearch(_)
        )
    }

    pub fn query(&self) -> Option<&str> {
        match self {
            ScanSource::LocalSearch(q) | ScanSource::RemoteSearch(q) | ScanSource::Recent(q) => {
                Some(q)
            }
            _ => None,
        }
    }
}

/// One enumeration request.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub entry: Entry,
    pub source: ScanSource,
    /// Root of the volume the entry is on. Volume-wide searches start here.
    pub search_root: Option<PathBuf>,
    pub refresh: bool,
}

/// Receives entries in the order they should be listed.
pub type BatchSink = mpsc::UnboundedSender<Vec<Entry>>;

/// Enumeration engine behind directory contents.
#[async_trait]
pub trait ContentScanner: Send + Sync {
    /// Enumerate `request`, delivering entries through `sink`.
    ///
    /// Implementations check `cancel` between batches and return
    /// `ScanError::Cancelled` once they observe it.
    async fn scan(
        &self,
        request: &ScanRequest,
        sink: BatchSink,
        cancel: &CancelToken,
    ) -> Result<(), ScanError>;
}

/// Sort criteria for listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortBy {
    /// Alphabetical (case-insensitive), default.
    Name,
    /// By file size (largest first).
    Size,
    /// By modification time (newest first).
    Modified,
}

impl SortBy {
    /// Parse sort_by from config string.
    pub fn from_config(s: &str) -> Self {
        match s {
            "size" => SortBy::Size,
            "modified" => SortBy::Modified,
            _ => SortBy::Name,
        }
    }
}

/// Knobs for `LocalScanner`.
#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub sort_by: SortBy,
    pub dirs_first: bool,
    pub batch_size: usize,
    pub recent_days: u64,
    pub max_search_results: usize,
    pub ignore_patterns: Vec<String>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            sort_by: SortBy::Name,
            dirs_first: true,
            batch_size: 100,
            recent_days: 30,
            max_search_results: 1000,
            ignore_patterns: Vec::new(),
        }
    }
}

/// `ContentScanner` over the local filesystem.
pub struct LocalScanner {
    options: ScanOptions,
}

type Listed = (Entry, EntryMetadata);

impl LocalScanner {
    pub fn new(options: ScanOptions) -> Self {
        Self { options }
    }

    /// Read one directory's immediate children.
    async fn read_children(&self, volume_id: &str, dir: &Path) -> Result<Vec<Listed>, ScanError> {
        let mut read_dir = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| ScanError::from_io(dir, &e))?;
        let mut children = Vec::new();
        loop {
            let next = match read_dir.next_entry().await {
                Ok(Some(next)) => next,
                Ok(None) => break,
                Err(_) => continue,
            };
            let path = next.path();
            // Broken symlinks and racing deletions are skipped.
            let Ok(metadata) = tokio::fs::symlink_metadata(&path).await else {
                continue;
            };
            let entry = Entry::new(volume_id, path, EntryKind::from_metadata(&metadata));
            let meta = EntryMetadata::from_fs(&entry, &metadata);
            children.push((entry, meta));
        }
        Ok(children)
    }

    fn sort(&self, items: &mut [Listed]) {
        let sort_by = &self.options.sort_by;
        let dirs_first = self.options.dirs_first;
        items.sort_by(|(a, am), (b, bm)| {
            let mut cmp = std::cmp::Ordering::Equal;

            if dirs_first {
                cmp = b.is_directory().cmp(&a.is_directory());
            }

            cmp.then_with(|| match sort_by {
                SortBy::Name => a.name().to_lowercase().cmp(&b.name().to_lowercase()),
                SortBy::Size => bm.size.cmp(&am.size),
                SortBy::Modified => bm.modified.cmp(&am.modified),
            })
        });
    }

    fn emit(
        &self,
        items: Vec<Listed>,
        sink: &BatchSink,
        cancel: &CancelToken,
    ) -> Result<(), ScanError> {
        let batch_size = self.options.batch_size.max(1);
        let entries: Vec<Entry> = items.into_iter().map(|(e, _)| e).collect();
        for chunk in entries.chunks(batch_size) {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            sink.send(chunk.to_vec()).map_err(|_| ScanError::Cancelled)?;
        }
        Ok(())
    }

    async fn list_directory(
        &self,
        request: &ScanRequest,
        sink: &BatchSink,
        cancel: &CancelToken,
    ) -> Result<(), ScanError> {
        let volume_id = volume_of(&request.entry)?;
        let mut children = self.read_children(volume_id, request.entry.path()).await?;
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        self.sort(&mut children);
        self.emit(children, sink, cancel)
    }

    /// Walk `root` breadth-first, calling `keep` on every entry. Matches are
    /// delivered per directory so large trees show up progressively.
    async fn walk<F>(
        &self,
        volume_id: &str,
        root: &Path,
        sink: &BatchSink,
        cancel: &CancelToken,
        mut keep: F,
    ) -> Result<(), ScanError>
    where
        F: FnMut(&Entry, &EntryMetadata) -> bool + Send,
    {
        let mut found = 0usize;
        let mut stack = vec![root.to_path_buf()];
        let mut first = true;

        while let Some(dir) = stack.pop() {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let children = match self.read_children(volume_id, &dir).await {
                Ok(children) => children,
                Err(e) if first => return Err(e),
                Err(e) => {
                    debug!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                    continue;
                }
            };
            first = false;

            let mut matches = Vec::new();
            for (entry, meta) in children {
                if should_ignore(entry.path(), root, &self.options.ignore_patterns) {
                    continue;
                }
                if entry.is_directory() {
                    stack.push(entry.path().to_path_buf());
                }
                if keep(&entry, &meta) {
                    matches.push((entry, meta));
                }
            }

            let room = self.options.max_search_results.saturating_sub(found);
            matches.truncate(room);
            found += matches.len();
            if !matches.is_empty() {
                self.sort(&mut matches);
                self.emit(matches, sink, cancel)?;
            }
            if found >= self.options.max_search_results {
                break;
            }
        }
        Ok(())
    }

    async fn list_recent(
        &self,
        request: &ScanRequest,
        query: &str,
        sink: &BatchSink,
        cancel: &CancelToken,
    ) -> Result<(), ScanError> {
        let volume_id = volume_of_search_root(request)?;
        let root = request
            .search_root
            .clone()
            .ok_or_else(|| ScanError::Unsupported("recent listing without a volume".into()))?;
        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs(
                self.options.recent_days.saturating_mul(24 * 60 * 60),
            ))
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let needle = query.to_lowercase();

        // Collect everything first so the newest files come out on top.
        let (tx, mut rx) = mpsc::unbounded_channel();
        let recent = LocalScanner::new(ScanOptions {
            max_search_results: usize::MAX,
            ..self.options.clone()
        });
        recent
            .walk(&volume_id, &root, &tx, cancel, |entry, meta| {
                !entry.is_directory()
                    && meta.modified.map(|m| m >= cutoff).unwrap_or(false)
                    && (needle.is_empty() || entry.name().to_lowercase().contains(&needle))
            })
            .await?;
        drop(tx);

        let mut all = Vec::new();
        while let Some(batch) = rx.recv().await {
            all.extend(batch);
        }
        let mut listed = Vec::with_capacity(all.len());
        for entry in all {
            if let Ok(metadata) = tokio::fs::symlink_metadata(entry.path()).await {
                let meta = EntryMetadata::from_fs(&entry, &metadata);
                listed.push((entry, meta));
            }
        }
        listed.sort_by(|(_, a), (_, b)| b.modified.cmp(&a.modified));
        listed.truncate(self.options.max_search_results);
        self.emit(listed, sink, cancel)
    }
}

fn volume_of(entry: &Entry) -> Result<&str, ScanError> {
    entry
        .volume_id()
        .ok_or_else(|| ScanError::Unsupported(format!("{} is not on a volume", entry)))
}

/// Volume id for volume-wide scans. Fake entries borrow it from the
/// volume whose root the request carries.
fn volume_of_search_root(request: &ScanRequest) -> Result<String, ScanError> {
    if let Some(id) = request.entry.volume_id() {
        return Ok(id.to_string());
    }
    Ok(request
        .entry
        .fake_root()
        .map(|r| r.as_str().to_string())
        .unwrap_or_else(|| "local".to_string()))
}

#[async_trait]
impl ContentScanner for LocalScanner {
    async fn scan(
        &self,
        request: &ScanRequest,
        sink: BatchSink,
        cancel: &CancelToken,
    ) -> Result<(), ScanError> {
        if let Some(root) = &request.search_root {
            if tokio::fs::metadata(root).await.is_err() {
                return Err(ScanError::VolumeDisconnected(root.display().to_string()));
            }
        }

        match &request.source {
            ScanSource::Directory | ScanSource::MediaView => {
                self.list_directory(request, &sink, cancel).await
            }
            ScanSource::LocalSearch(query) => {
                let volume_id = volume_of(&request.entry)?;
                let needle = query.to_lowercase();
                self.walk(volume_id, request.entry.path(), &sink, cancel, |entry, _| {
                    entry.name().to_lowercase().contains(&needle)
                })
                .await
            }
            ScanSource::RemoteSearch(query) => {
                let volume_id = volume_of(&request.entry)?;
                let root = request
                    .search_root
                    .clone()
                    .unwrap_or_else(|| request.entry.path().to_path_buf());
                let needle = query.to_lowercase();
                self.walk(volume_id, &root, &sink, cancel, |entry, _| {
                    entry.name().to_lowercase().contains(&needle)
                })
                .await
            }
            ScanSource::Recent(query) => self.list_recent(request, query, &sink, cancel).await,
            ScanSource::MetadataSearch(MetadataSearchType::RecentFiles) => {
                self.list_recent(request, "", &sink, cancel).await
            }
            ScanSource::MetadataSearch(kind) => Err(ScanError::Unsupported(format!(
                "{:?} listing needs a remote drive",
                kind
            ))),
            ScanSource::FakeRoot => Ok(()),
        }
    }
}
