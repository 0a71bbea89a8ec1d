use std::fmt;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// Type of filesystem entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    /// Classify from `symlink_metadata` output.
    pub fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        if metadata.is_symlink() {
            EntryKind::Symlink
        } else if metadata.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        }
    }
}

/// Root types a directory can belong to. Fake entries carry one directly;
/// real entries get theirs from the volume manager's location info.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootType {
    Downloads,
    MyFiles,
    Drive,
    DriveFakeRoot,
    DriveOffline,
    DriveSharedWithMe,
    DriveRecent,
    Recent,
    Removable,
    Archive,
    Provided,
    Mtp,
    MediaView,
    Android,
    Crostini,
}

impl RootType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RootType::Downloads => "downloads",
            RootType::MyFiles => "my_files",
            RootType::Drive => "drive",
            RootType::DriveFakeRoot => "drive_fake_root",
            RootType::DriveOffline => "drive_offline",
            RootType::DriveSharedWithMe => "drive_shared_with_me",
            RootType::DriveRecent => "drive_recent",
            RootType::Recent => "recent",
            RootType::Removable => "removable",
            RootType::Archive => "archive",
            RootType::Provided => "provided",
            RootType::Mtp => "mtp",
            RootType::MediaView => "media_view",
            RootType::Android => "android",
            RootType::Crostini => "crostini",
        }
    }

    /// Drive roots that are listed through a metadata search instead of
    /// a directory read.
    pub fn is_special_search_root(&self) -> bool {
        matches!(
            self,
            RootType::DriveOffline | RootType::DriveSharedWithMe | RootType::DriveRecent
        )
    }

    pub fn is_drive(&self) -> bool {
        matches!(
            self,
            RootType::Drive
                | RootType::DriveOffline
                | RootType::DriveSharedWithMe
                | RootType::DriveRecent
        )
    }
}

/// Handle identifying a filesystem location.
///
/// Entries are compared by URL only; two handles with the same URL are the
/// same entry even if one was resolved later than the other.
#[derive(Debug, Clone)]
pub struct Entry {
    url: String,
    volume_id: Option<String>,
    path: PathBuf,
    name: String,
    kind: EntryKind,
    fake_root: Option<RootType>,
}

impl Entry {
    /// A real entry on a mounted volume.
    pub fn new(volume_id: &str, path: impl Into<PathBuf>, kind: EntryKind) -> Self {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());
        Self {
            url: Self::url_for(volume_id, &path),
            volume_id: Some(volume_id.to_string()),
            path,
            name,
            kind,
            fake_root: None,
        }
    }

    /// A directory.
    pub fn directory(volume_id: &str, path: impl Into<PathBuf>) -> Self {
        Self::new(volume_id, path, EntryKind::Directory)
    }

    /// A regular file.
    pub fn file(volume_id: &str, path: impl Into<PathBuf>) -> Self {
        Self::new(volume_id, path, EntryKind::File)
    }

    /// A UI-only root with no backing directory (Recent, the Drive
    /// placeholder, MyFiles).
    pub fn fake(root_type: RootType, label: &str) -> Self {
        Self {
            url: format!("fake-entry://{}", root_type.as_str()),
            volume_id: None,
            path: PathBuf::new(),
            name: label.to_string(),
            kind: EntryKind::Directory,
            fake_root: Some(root_type),
        }
    }

    /// The URL an entry at `path` on `volume_id` is identified by.
    pub fn url_for(volume_id: &str, path: &Path) -> String {
        format!("filesystem:{}{}", volume_id, path.to_string_lossy())
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn volume_id(&self) -> Option<&str> {
        self.volume_id.as_deref()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn fake_root(&self) -> Option<RootType> {
        self.fake_root
    }

    pub fn is_fake(&self) -> bool {
        self.fake_root.is_some()
    }

    pub fn is_hidden(&self) -> bool {
        self.name.starts_with('.')
    }

    /// Parent directory on the same volume. Fake entries have none.
    pub fn parent(&self) -> Option<Entry> {
        let volume_id = self.volume_id.as_deref()?;
        let parent = self.path.parent()?;
        Some(Entry::directory(volume_id, parent))
    }

    /// A child of this directory on the same volume.
    pub fn child(&self, name: &str, kind: EntryKind) -> Option<Entry> {
        let volume_id = self.volume_id.as_deref()?;
        Some(Entry::new(volume_id, self.path.join(name), kind))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for Entry {}

impl Hash for Entry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url.hash(state);
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url)
    }
}

/// Collect the URLs of `entries`.
pub fn entries_to_urls<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Vec<String> {
    entries.into_iter().map(|e| e.url().to_string()).collect()
}
