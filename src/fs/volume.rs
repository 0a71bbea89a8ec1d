use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::{ModelError, Result};
use crate::fs::entry::{Entry, EntryKind, RootType};

/// Kind of mounted volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeType {
    Downloads,
    Drive,
    Removable,
    Archive,
    Provided,
    Mtp,
    Android,
    Crostini,
    MediaView,
}

impl VolumeType {
    /// Root type of the volume's own root directory.
    pub fn root_type(&self) -> RootType {
        match self {
            VolumeType::Downloads => RootType::Downloads,
            VolumeType::Drive => RootType::Drive,
            VolumeType::Removable => RootType::Removable,
            VolumeType::Archive => RootType::Archive,
            VolumeType::Provided => RootType::Provided,
            VolumeType::Mtp => RootType::Mtp,
            VolumeType::Android => RootType::Android,
            VolumeType::Crostini => RootType::Crostini,
            VolumeType::MediaView => RootType::MediaView,
        }
    }
}

/// A mounted volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub id: String,
    pub volume_type: VolumeType,
    pub root: PathBuf,
    pub label: String,
    pub read_only: bool,
    /// Backed by a remote drive that supports server-side search.
    pub drive_based: bool,
}

impl VolumeInfo {
    pub fn new(id: &str, volume_type: VolumeType, root: impl Into<PathBuf>) -> Self {
        Self {
            id: id.to_string(),
            volume_type,
            root: root.into(),
            label: id.to_string(),
            read_only: false,
            drive_based: volume_type == VolumeType::Drive,
        }
    }

    /// The directory shown when the volume is opened.
    pub fn display_root(&self) -> Entry {
        Entry::directory(&self.id, &self.root)
    }
}

/// Where an entry lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationInfo {
    pub volume: VolumeInfo,
    pub root_type: RootType,
    pub is_root_entry: bool,
    pub is_read_only: bool,
    pub is_drive_based: bool,
    pub is_special_search_root: bool,
}

/// Result of resolving a batch of URLs back into entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedUrls {
    pub entries: Vec<Entry>,
    pub failures: Vec<String>,
}

/// Access to mounted volumes and entry resolution.
#[async_trait]
pub trait VolumeManager: Send + Sync {
    /// The volume `entry` lives on, if it is mounted.
    fn volume_info(&self, entry: &Entry) -> Option<VolumeInfo>;

    /// Location details for `entry`, if it is on a mounted volume.
    fn location_info(&self, entry: &Entry) -> Option<LocationInfo>;

    /// Whether the remote drive is unreachable.
    fn drive_connection_offline(&self) -> bool;

    /// Display root of the default volume.
    fn default_display_root(&self) -> Option<Entry>;

    /// Resolve URLs into entries. URLs that no longer exist are reported as
    /// failures, not errors.
    async fn resolve_urls(&self, urls: Vec<String>) -> Result<ResolvedUrls>;

    /// Whether `entry` still exists as a directory.
    async fn directory_exists(&self, entry: &Entry) -> bool;
}

/// Volumes backed by local directories.
pub struct LocalVolumeManager {
    volumes: RwLock<Vec<VolumeInfo>>,
    offline: AtomicBool,
}

impl LocalVolumeManager {
    pub fn new(volumes: Vec<VolumeInfo>) -> Self {
        Self {
            volumes: RwLock::new(volumes),
            offline: AtomicBool::new(false),
        }
    }

    /// Register a new volume. Replaces any volume with the same id.
    pub fn mount(&self, volume: VolumeInfo) {
        if let Ok(mut volumes) = self.volumes.write() {
            volumes.retain(|v| v.id != volume.id);
            volumes.push(volume);
        }
    }

    /// Remove a volume, returning it if it was mounted.
    pub fn unmount(&self, id: &str) -> Option<VolumeInfo> {
        let mut volumes = self.volumes.write().ok()?;
        let index = volumes.iter().position(|v| v.id == id)?;
        Some(volumes.remove(index))
    }

    pub fn set_drive_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Relaxed);
    }

    pub fn volumes(&self) -> Vec<VolumeInfo> {
        self.volumes
            .read()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    fn find(&self, id: &str) -> Option<VolumeInfo> {
        self.volumes
            .read()
            .ok()?
            .iter()
            .find(|v| v.id == id)
            .cloned()
    }

    fn first_drive(&self) -> Option<VolumeInfo> {
        self.volumes
            .read()
            .ok()?
            .iter()
            .find(|v| v.volume_type == VolumeType::Drive)
            .cloned()
    }

    /// Split a `filesystem:` URL into its volume and absolute path.
    fn parse_url(&self, url: &str) -> Option<(VolumeInfo, PathBuf)> {
        let rest = url.strip_prefix("filesystem:")?;
        let volumes = self.volumes.read().ok()?;
        volumes.iter().find_map(|v| {
            let path = rest.strip_prefix(v.id.as_str())?;
            if path.starts_with('/') {
                Some((v.clone(), PathBuf::from(path)))
            } else {
                None
            }
        })
    }
}

#[async_trait]
impl VolumeManager for LocalVolumeManager {
    fn volume_info(&self, entry: &Entry) -> Option<VolumeInfo> {
        if let Some(root) = entry.fake_root() {
            return if root.is_drive() {
                self.first_drive()
            } else {
                None
            };
        }
        let volume = self.find(entry.volume_id()?)?;
        if entry.path().starts_with(&volume.root) {
            Some(volume)
        } else {
            None
        }
    }

    fn location_info(&self, entry: &Entry) -> Option<LocationInfo> {
        if let Some(root) = entry.fake_root() {
            if !root.is_special_search_root() {
                return None;
            }
            let volume = self.first_drive()?;
            return Some(LocationInfo {
                is_read_only: true,
                is_drive_based: true,
                volume,
                root_type: root,
                is_root_entry: true,
                is_special_search_root: true,
            });
        }
        let volume = self.volume_info(entry)?;
        Some(LocationInfo {
            root_type: volume.volume_type.root_type(),
            is_root_entry: entry.path() == volume.root.as_path(),
            is_read_only: volume.read_only,
            is_drive_based: volume.drive_based,
            is_special_search_root: false,
            volume,
        })
    }

    fn drive_connection_offline(&self) -> bool {
        self.offline.load(Ordering::Relaxed)
    }

    fn default_display_root(&self) -> Option<Entry> {
        self.volumes
            .read()
            .ok()?
            .first()
            .map(VolumeInfo::display_root)
    }

    async fn resolve_urls(&self, urls: Vec<String>) -> Result<ResolvedUrls> {
        let mut resolved = ResolvedUrls::default();
        for url in urls {
            let Some((volume, path)) = self.parse_url(&url) else {
                resolved.failures.push(url);
                continue;
            };
            match tokio::fs::symlink_metadata(&path).await {
                Ok(metadata) => resolved.entries.push(Entry::new(
                    &volume.id,
                    path,
                    EntryKind::from_metadata(&metadata),
                )),
                Err(e) => {
                    debug!(url = %url, error = %e, "URL no longer resolves");
                    resolved.failures.push(url);
                }
            }
        }
        Ok(resolved)
    }

    async fn directory_exists(&self, entry: &Entry) -> bool {
        if entry.is_fake() {
            return true;
        }
        tokio::fs::metadata(entry.path())
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

/// Build the default single-volume setup for `root`.
pub fn single_volume(root: &Path) -> Result<LocalVolumeManager> {
    if !root.is_absolute() {
        return Err(ModelError::InvalidPath(format!(
            "{} is not absolute",
            root.display()
        )));
    }
    Ok(LocalVolumeManager::new(vec![VolumeInfo::new(
        "local",
        VolumeType::Downloads,
        root,
    )]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> LocalVolumeManager {
        single_volume(dir.path()).unwrap()
    }

    #[test]
    fn location_of_root_and_child() {
        let dir = TempDir::new().unwrap();
        let volumes = manager(&dir);
        let root = Entry::directory("local", dir.path());
        let child = Entry::directory("local", dir.path().join("sub"));

        let root_info = volumes.location_info(&root).unwrap();
        assert!(root_info.is_root_entry);
        assert_eq!(root_info.root_type, RootType::Downloads);

        let child_info = volumes.location_info(&child).unwrap();
        assert!(!child_info.is_root_entry);
    }

    #[test]
    fn entries_outside_volume_are_unknown() {
        let dir = TempDir::new().unwrap();
        let volumes = manager(&dir);
        assert!(volumes
            .volume_info(&Entry::directory("local", "/definitely/elsewhere"))
            .is_none());
        assert!(volumes
            .volume_info(&Entry::directory("usb", dir.path()))
            .is_none());
    }

    #[test]
    fn special_drive_roots_need_a_drive() {
        let dir = TempDir::new().unwrap();
        let volumes = manager(&dir);
        let offline = Entry::fake(RootType::DriveOffline, "Offline");
        assert!(volumes.location_info(&offline).is_none());

        volumes.mount(VolumeInfo::new("drive", VolumeType::Drive, dir.path()));
        let info = volumes.location_info(&offline).unwrap();
        assert!(info.is_special_search_root);
        assert_eq!(info.root_type, RootType::DriveOffline);
    }

    #[test]
    fn mount_and_unmount() {
        let dir = TempDir::new().unwrap();
        let volumes = manager(&dir);
        volumes.mount(VolumeInfo::new("usb", VolumeType::Removable, "/media/usb"));
        assert_eq!(volumes.volumes().len(), 2);
        let removed = volumes.unmount("usb").unwrap();
        assert_eq!(removed.volume_type, VolumeType::Removable);
        assert!(volumes.unmount("usb").is_none());
    }

    #[test]
    fn relative_root_is_rejected() {
        assert!(matches!(
            single_volume(Path::new("relative/dir")),
            Err(ModelError::InvalidPath(_))
        ));
    }

    #[tokio::test]
    async fn resolve_urls_splits_failures() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        let volumes = manager(&dir);

        let present = Entry::url_for("local", &dir.path().join("a.txt"));
        let missing = Entry::url_for("local", &dir.path().join("gone.txt"));
        let foreign = "filesystem:nowhere/x".to_string();

        let resolved = volumes
            .resolve_urls(vec![present.clone(), missing.clone(), foreign.clone()])
            .await
            .unwrap();
        assert_eq!(resolved.entries.len(), 1);
        assert_eq!(resolved.entries[0].url(), present);
        assert_eq!(resolved.failures, vec![missing, foreign]);
    }

    #[tokio::test]
    async fn directory_exists_checks_disk() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let volumes = manager(&dir);
        assert!(
            volumes
                .directory_exists(&Entry::directory("local", dir.path().join("sub")))
                .await
        );
        assert!(
            !volumes
                .directory_exists(&Entry::directory("local", dir.path().join("nope")))
                .await
        );
        assert!(
            volumes
                .directory_exists(&Entry::fake(RootType::Recent, "Recent"))
                .await
        );
    }
}
