use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::fs::entry::Entry;

/// File metadata cached per entry URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    pub size: u64,
    pub modified: Option<SystemTime>,
    pub is_hidden: bool,
}

impl EntryMetadata {
    pub fn from_fs(entry: &Entry, metadata: &std::fs::Metadata) -> Self {
        Self {
            size: metadata.len(),
            modified: metadata.modified().ok(),
            is_hidden: entry.is_hidden(),
        }
    }
}

/// Metadata source used for prefetching around scans.
#[async_trait]
pub trait MetadataModel: Send + Sync {
    /// Fetch metadata for `entries`, bypassing the cache when `refresh`.
    /// Entries whose metadata cannot be read yield `None`.
    async fn get(&self, entries: &[Entry], refresh: bool) -> Vec<Option<EntryMetadata>>;

    /// Invalidate cached metadata for newly created entries.
    fn notify_entries_created(&self, entries: &[Entry]);

    /// Drop cached metadata for entries that left the view.
    fn notify_entries_removed(&self, urls: &[String]);
}

/// `MetadataModel` backed by `tokio::fs` with an in-memory cache.
#[derive(Default)]
pub struct MetadataCache {
    cache: Mutex<HashMap<String, EntryMetadata>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached metadata for `url`, without touching the disk.
    pub fn cached(&self, url: &str) -> Option<EntryMetadata> {
        self.cache.lock().ok()?.get(url).cloned()
    }

    pub fn len(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl MetadataModel for MetadataCache {
    async fn get(&self, entries: &[Entry], refresh: bool) -> Vec<Option<EntryMetadata>> {
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.is_fake() {
                out.push(None);
                continue;
            }
            if !refresh {
                if let Some(hit) = self.cached(entry.url()) {
                    out.push(Some(hit));
                    continue;
                }
            }
            let fetched = tokio::fs::symlink_metadata(entry.path())
                .await
                .ok()
                .map(|m| EntryMetadata::from_fs(entry, &m));
            if let (Some(meta), Ok(mut cache)) = (&fetched, self.cache.lock()) {
                cache.insert(entry.url().to_string(), meta.clone());
            }
            out.push(fetched);
        }
        out
    }

    fn notify_entries_created(&self, entries: &[Entry]) {
        if let Ok(mut cache) = self.cache.lock() {
            for entry in entries {
                cache.remove(entry.url());
            }
        }
    }

    fn notify_entries_removed(&self, urls: &[String]) {
        if let Ok(mut cache) = self.cache.lock() {
            for url in urls {
                cache.remove(url);
            }
        }
    }
}
