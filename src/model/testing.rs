//! Fake collaborators for model tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::cancel::CancelToken;
use crate::error::{ModelError, Result, ScanError};
use crate::event::WatcherEvent;
use crate::fs::entry::Entry;
use crate::fs::metadata::{EntryMetadata, MetadataModel};
use crate::fs::scanner::{BatchSink, ContentScanner, ScanRequest, ScanSource};
use crate::fs::volume::{
    LocalVolumeManager, LocationInfo, ResolvedUrls, VolumeInfo, VolumeManager, VolumeType,
};
use crate::fs::watcher::FileWatcher;

#[derive(Default)]
struct Script {
    listing: Vec<Entry>,
    failure: Option<ScanError>,
    delay: Duration,
}

/// Scanner that serves canned listings keyed by directory path.
pub struct ScriptedScanner {
    scripts: Mutex<HashMap<PathBuf, Script>>,
    gates: Mutex<HashMap<PathBuf, watch::Sender<bool>>>,
    counts: Mutex<HashMap<PathBuf, usize>>,
    batch_size: usize,
}

impl ScriptedScanner {
    pub fn new() -> Self {
        Self::with_batch_size(usize::MAX)
    }

    pub fn with_batch_size(batch_size: usize) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            counts: Mutex::new(HashMap::new()),
            batch_size,
        }
    }

    pub fn set_listing(&self, path: impl AsRef<Path>, listing: Vec<Entry>) {
        let mut scripts = self.scripts.lock().unwrap();
        let script = scripts.entry(path.as_ref().to_path_buf()).or_default();
        script.listing = listing;
        script.failure = None;
    }

    pub fn fail(&self, path: impl AsRef<Path>, error: ScanError) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(path.as_ref().to_path_buf()).or_default().failure = Some(error);
    }

    pub fn set_delay(&self, path: impl AsRef<Path>, delay: Duration) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.entry(path.as_ref().to_path_buf()).or_default().delay = delay;
    }

    /// Hold scans of `path` until `release` is called.
    pub fn gate(&self, path: impl AsRef<Path>) {
        let (tx, _rx) = watch::channel(false);
        self.gates
            .lock()
            .unwrap()
            .insert(path.as_ref().to_path_buf(), tx);
    }

    pub fn release(&self, path: impl AsRef<Path>) {
        if let Some(gate) = self.gates.lock().unwrap().get(path.as_ref()) {
            gate.send_replace(true);
        }
    }

    pub fn scan_count(&self, path: impl AsRef<Path>) -> usize {
        self.counts
            .lock()
            .unwrap()
            .get(path.as_ref())
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ContentScanner for ScriptedScanner {
    async fn scan(
        &self,
        request: &ScanRequest,
        sink: BatchSink,
        cancel: &CancelToken,
    ) -> std::result::Result<(), ScanError> {
        let path = request.entry.path().to_path_buf();
        *self.counts.lock().unwrap().entry(path.clone()).or_default() += 1;
        if request.source == ScanSource::FakeRoot {
            return Ok(());
        }

        let gate = self.gates.lock().unwrap().get(&path).map(|g| g.subscribe());
        if let Some(mut gate) = gate {
            let _ = gate.wait_for(|open| *open).await;
        }

        let (listing, failure, delay) = {
            let scripts = self.scripts.lock().unwrap();
            match scripts.get(&path) {
                Some(s) => (s.listing.clone(), s.failure.clone(), s.delay),
                None => (Vec::new(), Some(ScanError::NotFound(path.clone())), Duration::ZERO),
            }
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if cancel.is_cancelled() {
            return Err(ScanError::Cancelled);
        }
        if let Some(error) = failure {
            return Err(error);
        }

        let listing: Vec<Entry> = match &request.source {
            ScanSource::LocalSearch(q) | ScanSource::RemoteSearch(q) => listing
                .into_iter()
                .filter(|e| e.name().contains(q.as_str()))
                .collect(),
            _ => listing,
        };
        for chunk in listing.chunks(self.batch_size.max(1)) {
            if cancel.is_cancelled() {
                return Err(ScanError::Cancelled);
            }
            let _ = sink.send(chunk.to_vec());
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// Metadata model that records notifications.
#[derive(Default)]
pub struct FakeMetadata {
    pub removed: Mutex<Vec<String>>,
    pub created: Mutex<Vec<String>>,
    pub fetched: Mutex<Vec<String>>,
}

#[async_trait]
impl MetadataModel for FakeMetadata {
    async fn get(&self, entries: &[Entry], _refresh: bool) -> Vec<Option<EntryMetadata>> {
        self.fetched
            .lock()
            .unwrap()
            .extend(entries.iter().map(|e| e.url().to_string()));
        vec![None; entries.len()]
    }

    fn notify_entries_created(&self, entries: &[Entry]) {
        self.created
            .lock()
            .unwrap()
            .extend(entries.iter().map(|e| e.url().to_string()));
    }

    fn notify_entries_removed(&self, urls: &[String]) {
        self.removed.lock().unwrap().extend(urls.iter().cloned());
    }
}

/// Volume manager over in-memory paths.
pub struct FakeVolumes {
    pub inner: LocalVolumeManager,
    missing_dirs: Mutex<HashSet<PathBuf>>,
    unresolvable: Mutex<HashSet<String>>,
    resolve_error: Mutex<bool>,
}

impl FakeVolumes {
    /// A single Downloads volume rooted at `/docs`.
    pub fn new() -> Self {
        Self::with_volumes(vec![VolumeInfo::new("local", VolumeType::Downloads, "/docs")])
    }

    pub fn with_volumes(volumes: Vec<VolumeInfo>) -> Self {
        Self {
            inner: LocalVolumeManager::new(volumes),
            missing_dirs: Mutex::new(HashSet::new()),
            unresolvable: Mutex::new(HashSet::new()),
            resolve_error: Mutex::new(false),
        }
    }

    pub fn remove_dir(&self, path: impl AsRef<Path>) {
        self.missing_dirs
            .lock()
            .unwrap()
            .insert(path.as_ref().to_path_buf());
    }

    pub fn make_unresolvable(&self, url: &str) {
        self.unresolvable.lock().unwrap().insert(url.to_string());
    }

    pub fn fail_resolution(&self, fail: bool) {
        *self.resolve_error.lock().unwrap() = fail;
    }
}

#[async_trait]
impl VolumeManager for FakeVolumes {
    fn volume_info(&self, entry: &Entry) -> Option<VolumeInfo> {
        self.inner.volume_info(entry)
    }

    fn location_info(&self, entry: &Entry) -> Option<LocationInfo> {
        self.inner.location_info(entry)
    }

    fn drive_connection_offline(&self) -> bool {
        self.inner.drive_connection_offline()
    }

    fn default_display_root(&self) -> Option<Entry> {
        self.inner.default_display_root()
    }

    async fn resolve_urls(&self, urls: Vec<String>) -> Result<ResolvedUrls> {
        if *self.resolve_error.lock().unwrap() {
            return Err(ModelError::InvalidPath("resolution failed".into()));
        }
        let unresolvable = self.unresolvable.lock().unwrap().clone();
        let mut resolved = ResolvedUrls::default();
        for url in urls {
            let path = url
                .strip_prefix("filesystem:")
                .and_then(|rest| rest.find('/').map(|i| (rest[..i].to_string(), rest[i..].to_string())));
            match path {
                Some((volume, path)) if !unresolvable.contains(&url) => {
                    resolved.entries.push(Entry::file(&volume, path))
                }
                _ => resolved.failures.push(url),
            }
        }
        Ok(resolved)
    }

    async fn directory_exists(&self, entry: &Entry) -> bool {
        !self.missing_dirs.lock().unwrap().contains(entry.path())
    }
}

/// Watcher that records subscriptions and lets tests inject events.
#[derive(Default)]
pub struct FakeWatcher {
    pub watched: Mutex<Vec<Entry>>,
    sink: Mutex<Option<mpsc::UnboundedSender<WatcherEvent>>>,
    delay: Mutex<Duration>,
    pub stopped: Mutex<bool>,
}

impl FakeWatcher {
    /// Make every resubscription take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn emit(&self, event: WatcherEvent) {
        if let Some(sink) = self.sink.lock().unwrap().as_ref() {
            sink.send(event).unwrap();
        }
    }
}

#[async_trait]
impl FileWatcher for FakeWatcher {
    async fn change_watched_directory(
        &self,
        entry: &Entry,
        sink: mpsc::UnboundedSender<WatcherEvent>,
    ) -> Result<()> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.watched.lock().unwrap().push(entry.clone());
        *self.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn stop(&self) {
        *self.stopped.lock().unwrap() = true;
    }
}
