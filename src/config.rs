//! Configuration: TOML file loading, CLI overrides, and defaults.
//!
//! Resolution order (first found wins, values merge/override):
//! 1. CLI flags (`--config`, `--show-hidden`, `--no-watcher`)
//! 2. `$DIRMODEL_CONFIG` environment variable (path to config file)
//! 3. Project-local `.dirmodel.toml` in the current working directory
//! 4. Global `~/.config/dirmodel/config.toml`
//! 5. Built-in defaults

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{ModelError, Result};
use crate::fs::scanner::{ScanOptions, SortBy};
use crate::fs::volume::{single_volume, LocalVolumeManager, VolumeInfo, VolumeType};
use crate::fs::watcher::{NotifyWatcher, DEFAULT_FLOOD_THRESHOLD, DEFAULT_IGNORE_PATTERNS};
use crate::model::ModelConfig;

// ── Section configs ──────────────────────────────────────────────────────────

/// General settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GeneralConfig {
    /// Starting directory (overridden by CLI positional arg).
    pub default_path: Option<String>,
    /// Show hidden files by default.
    pub show_hidden: Option<bool>,
    /// Allow at most one selected entry.
    pub single_selection: Option<bool>,
}

/// Rescan timing and retry policy.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RescanConfig {
    pub short_interval_ms: Option<u64>,
    pub coalesce_interval_ms: Option<u64>,
    pub aggregator_window_ms: Option<u64>,
    /// Consecutive failures that are still retried automatically.
    pub max_auto_retries: Option<u32>,
}

/// Local scanner settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ScanConfig {
    /// Sort order: "name", "size", "modified".
    pub sort_by: Option<String>,
    /// Directories always listed first.
    pub dirs_first: Option<bool>,
    pub batch_size: Option<usize>,
    /// Age limit for the Recent root.
    pub recent_days: Option<u64>,
    pub max_search_results: Option<usize>,
}

/// Filesystem watcher settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct WatcherConfig {
    /// Enable filesystem watcher for auto-refresh.
    pub enabled: Option<bool>,
    /// Debounce interval in milliseconds.
    pub debounce_ms: Option<u64>,
    /// Events per debounce window above which a full rescan is requested.
    pub flood_threshold: Option<usize>,
    /// Names skipped by the watcher and by searches.
    pub ignore: Option<Vec<String>>,
}

/// A volume definition from `[[volumes]]`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct VolumeConfig {
    pub id: String,
    pub root: PathBuf,
    #[serde(rename = "type")]
    pub volume_type: VolumeType,
    pub label: Option<String>,
    #[serde(default)]
    pub read_only: bool,
    pub drive_based: Option<bool>,
}

impl VolumeConfig {
    fn to_volume_info(&self) -> Result<VolumeInfo> {
        if !self.root.is_absolute() {
            return Err(ModelError::Config(format!(
                "volume {}: root {} is not absolute",
                self.id,
                self.root.display()
            )));
        }
        let mut info = VolumeInfo::new(&self.id, self.volume_type, &self.root);
        if let Some(label) = &self.label {
            info.label = label.clone();
        }
        info.read_only = self.read_only;
        if let Some(drive_based) = self.drive_based {
            info.drive_based = drive_based;
        }
        Ok(info)
    }
}

// ── Top-level config ─────────────────────────────────────────────────────────

/// Top-level configuration.
///
/// All fields are optional so that partial configs from different sources
/// can be merged together (CLI overrides file, file overrides defaults).
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub rescan: RescanConfig,
    pub scan: ScanConfig,
    pub watcher: WatcherConfig,
    pub volumes: Option<Vec<VolumeConfig>>,
}

// ── Default constants ────────────────────────────────────────────────────────

pub const DEFAULT_SHORT_INTERVAL_MS: u64 = 100;
pub const DEFAULT_COALESCE_INTERVAL_MS: u64 = 500;
pub const DEFAULT_AGGREGATOR_WINDOW_MS: u64 = 500;
pub const DEFAULT_MAX_AUTO_RETRIES: u32 = 1;
/// Default debounce interval in milliseconds.
pub const DEFAULT_DEBOUNCE_MS: u64 = 300;

// ── Config file locator ──────────────────────────────────────────────────────

/// Return the list of candidate config file paths in priority order.
///
/// Does NOT include the CLI `--config` path, which is handled separately.
fn candidate_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(env_path) = std::env::var("DIRMODEL_CONFIG") {
        paths.push(PathBuf::from(env_path));
    }

    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd.join(".dirmodel.toml"));
    }

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("dirmodel").join("config.toml"));
    }

    paths
}

/// Try to read and parse a TOML config file. Returns `None` if the file
/// doesn't exist or can't be parsed (with a warning logged).
fn load_file(path: &Path) -> Option<AppConfig> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<AppConfig>(&content) {
        Ok(cfg) => {
            debug!(path = %path.display(), "Loaded config file");
            Some(cfg)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse config file");
            None
        }
    }
}

// ── Merge logic ──────────────────────────────────────────────────────────────

impl AppConfig {
    /// Merge `other` on top of `self`: `other`'s `Some` values win.
    pub fn merge(self, other: &AppConfig) -> AppConfig {
        AppConfig {
            general: GeneralConfig {
                default_path: other
                    .general
                    .default_path
                    .clone()
                    .or(self.general.default_path),
                show_hidden: other.general.show_hidden.or(self.general.show_hidden),
                single_selection: other
                    .general
                    .single_selection
                    .or(self.general.single_selection),
            },
            rescan: RescanConfig {
                short_interval_ms: other
                    .rescan
                    .short_interval_ms
                    .or(self.rescan.short_interval_ms),
                coalesce_interval_ms: other
                    .rescan
                    .coalesce_interval_ms
                    .or(self.rescan.coalesce_interval_ms),
                aggregator_window_ms: other
                    .rescan
                    .aggregator_window_ms
                    .or(self.rescan.aggregator_window_ms),
                max_auto_retries: other
                    .rescan
                    .max_auto_retries
                    .or(self.rescan.max_auto_retries),
            },
            scan: ScanConfig {
                sort_by: other.scan.sort_by.clone().or(self.scan.sort_by),
                dirs_first: other.scan.dirs_first.or(self.scan.dirs_first),
                batch_size: other.scan.batch_size.or(self.scan.batch_size),
                recent_days: other.scan.recent_days.or(self.scan.recent_days),
                max_search_results: other
                    .scan
                    .max_search_results
                    .or(self.scan.max_search_results),
            },
            watcher: WatcherConfig {
                enabled: other.watcher.enabled.or(self.watcher.enabled),
                debounce_ms: other.watcher.debounce_ms.or(self.watcher.debounce_ms),
                flood_threshold: other
                    .watcher
                    .flood_threshold
                    .or(self.watcher.flood_threshold),
                ignore: other.watcher.ignore.clone().or(self.watcher.ignore),
            },
            volumes: other.volumes.clone().or(self.volumes),
        }
    }

    /// Load the final merged configuration.
    ///
    /// `cli_config_path` is an explicit config file path from `--config`.
    /// `cli_overrides` are partial overrides derived from CLI flags.
    pub fn load(cli_config_path: Option<&Path>, cli_overrides: Option<&AppConfig>) -> AppConfig {
        let mut config = AppConfig::default();

        // Lowest priority first so higher overwrites.
        for path in candidate_paths().iter().rev() {
            if let Some(file_cfg) = load_file(path) {
                config = config.merge(&file_cfg);
            }
        }

        if let Some(cli_path) = cli_config_path {
            match load_file(cli_path) {
                Some(file_cfg) => config = config.merge(&file_cfg),
                None => warn!(path = %cli_path.display(), "Config file not loaded"),
            }
        }

        if let Some(overrides) = cli_overrides {
            config = config.merge(overrides);
        }

        config
    }

    // ── Convenience getters with built-in defaults ──────────────────────────

    pub fn show_hidden(&self) -> bool {
        self.general.show_hidden.unwrap_or(false)
    }

    pub fn single_selection(&self) -> bool {
        self.general.single_selection.unwrap_or(false)
    }

    pub fn short_interval(&self) -> Duration {
        Duration::from_millis(
            self.rescan
                .short_interval_ms
                .unwrap_or(DEFAULT_SHORT_INTERVAL_MS),
        )
    }

    pub fn coalesce_interval(&self) -> Duration {
        Duration::from_millis(
            self.rescan
                .coalesce_interval_ms
                .unwrap_or(DEFAULT_COALESCE_INTERVAL_MS),
        )
    }

    pub fn aggregator_window(&self) -> Duration {
        Duration::from_millis(
            self.rescan
                .aggregator_window_ms
                .unwrap_or(DEFAULT_AGGREGATOR_WINDOW_MS),
        )
    }

    pub fn max_auto_retries(&self) -> u32 {
        self.rescan
            .max_auto_retries
            .unwrap_or(DEFAULT_MAX_AUTO_RETRIES)
    }

    /// Sort mode: "name", "size", or "modified".
    pub fn sort_by(&self) -> &str {
        self.scan.sort_by.as_deref().unwrap_or("name")
    }

    pub fn dirs_first(&self) -> bool {
        self.scan.dirs_first.unwrap_or(true)
    }

    pub fn watcher_enabled(&self) -> bool {
        self.watcher.enabled.unwrap_or(true)
    }

    pub fn debounce_ms(&self) -> u64 {
        self.watcher.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)
    }

    pub fn ignore_patterns(&self) -> Vec<String> {
        self.watcher.ignore.clone().unwrap_or_else(|| {
            DEFAULT_IGNORE_PATTERNS
                .iter()
                .map(|s| s.to_string())
                .collect()
        })
    }

    // ── Conversions ─────────────────────────────────────────────────────────

    pub fn model_config(&self) -> ModelConfig {
        ModelConfig {
            short_interval: self.short_interval(),
            coalesce_interval: self.coalesce_interval(),
            aggregator_window: self.aggregator_window(),
            max_auto_retries: self.max_auto_retries(),
            single_selection: self.single_selection(),
            show_hidden: self.show_hidden(),
            ..ModelConfig::default()
        }
    }

    pub fn scan_options(&self) -> ScanOptions {
        let defaults = ScanOptions::default();
        ScanOptions {
            sort_by: SortBy::from_config(self.sort_by()),
            dirs_first: self.dirs_first(),
            batch_size: self.scan.batch_size.unwrap_or(defaults.batch_size).max(1),
            recent_days: self.scan.recent_days.unwrap_or(defaults.recent_days),
            max_search_results: self
                .scan
                .max_search_results
                .unwrap_or(defaults.max_search_results),
            ignore_patterns: self.ignore_patterns(),
        }
    }

    /// Build the file watcher. A disabled watcher is created paused.
    pub fn file_watcher(&self) -> NotifyWatcher {
        let watcher = NotifyWatcher::new(
            Duration::from_millis(self.debounce_ms()),
            self.ignore_patterns(),
            self.watcher
                .flood_threshold
                .unwrap_or(DEFAULT_FLOOD_THRESHOLD),
        );
        if !self.watcher_enabled() {
            watcher.pause();
        }
        watcher
    }

    /// Build the volume manager from `[[volumes]]`, or a single volume rooted
    /// at `fallback_root` when none are configured.
    pub fn volume_manager(&self, fallback_root: &Path) -> Result<LocalVolumeManager> {
        match self.volumes.as_deref() {
            Some(volumes) if !volumes.is_empty() => {
                let infos = volumes
                    .iter()
                    .map(VolumeConfig::to_volume_info)
                    .collect::<Result<Vec<_>>>()?;
                Ok(LocalVolumeManager::new(infos))
            }
            _ => single_volume(fallback_root),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::entry::Entry;
    use crate::fs::volume::VolumeManager;

    #[test]
    fn test_default_values() {
        let cfg = AppConfig::default();
        assert!(!cfg.show_hidden());
        assert!(!cfg.single_selection());
        assert_eq!(cfg.short_interval(), Duration::from_millis(100));
        assert_eq!(cfg.coalesce_interval(), Duration::from_millis(500));
        assert_eq!(cfg.aggregator_window(), Duration::from_millis(500));
        assert_eq!(cfg.max_auto_retries(), 1);
        assert_eq!(cfg.sort_by(), "name");
        assert!(cfg.dirs_first());
        assert!(cfg.watcher_enabled());
        assert_eq!(cfg.debounce_ms(), 300);
        assert!(cfg.ignore_patterns().contains(&".git".to_string()));
    }

    #[test]
    fn test_toml_parsing_full() {
        let toml = r#"
[general]
default_path = "/srv"
show_hidden = true
single_selection = true

[rescan]
short_interval_ms = 50
coalesce_interval_ms = 1000
aggregator_window_ms = 250
max_auto_retries = 3

[scan]
sort_by = "size"
dirs_first = false
batch_size = 10
recent_days = 7
max_search_results = 20

[watcher]
enabled = false
debounce_ms = 500
flood_threshold = 10
ignore = ["build"]

[[volumes]]
id = "home"
root = "/home/user"
type = "downloads"

[[volumes]]
id = "usb"
root = "/media/usb"
type = "removable"
label = "Stick"
read_only = true
"#;
        let cfg: AppConfig = toml::from_str(toml).expect("parse failed");
        assert_eq!(cfg.general.default_path.as_deref(), Some("/srv"));
        assert!(cfg.show_hidden());
        assert!(cfg.single_selection());
        assert_eq!(cfg.short_interval(), Duration::from_millis(50));
        assert_eq!(cfg.coalesce_interval(), Duration::from_secs(1));
        assert_eq!(cfg.aggregator_window(), Duration::from_millis(250));
        assert_eq!(cfg.max_auto_retries(), 3);
        assert!(!cfg.watcher_enabled());
        assert_eq!(cfg.ignore_patterns(), vec!["build".to_string()]);

        let options = cfg.scan_options();
        assert_eq!(options.sort_by, SortBy::Size);
        assert!(!options.dirs_first);
        assert_eq!(options.batch_size, 10);
        assert_eq!(options.recent_days, 7);
        assert_eq!(options.max_search_results, 20);

        let volumes = cfg.volumes.as_ref().expect("volumes");
        assert_eq!(volumes.len(), 2);
        assert_eq!(volumes[1].volume_type, VolumeType::Removable);
        assert_eq!(volumes[1].label.as_deref(), Some("Stick"));
        assert!(volumes[1].read_only);
    }

    #[test]
    fn test_toml_parsing_partial() {
        let toml = r#"
[rescan]
max_auto_retries = 0
"#;
        let cfg: AppConfig = toml::from_str(toml).expect("parse failed");
        assert_eq!(cfg.max_auto_retries(), 0);
        assert_eq!(cfg.short_interval(), Duration::from_millis(100));
        assert_eq!(cfg.sort_by(), "name");
        assert!(cfg.volumes.is_none());
    }

    #[test]
    fn test_toml_parsing_empty() {
        let cfg: AppConfig = toml::from_str("").expect("parse failed");
        assert!(!cfg.show_hidden());
        assert!(cfg.watcher_enabled());
    }

    #[test]
    fn test_merge_overrides() {
        let base = AppConfig {
            general: GeneralConfig {
                show_hidden: Some(false),
                single_selection: Some(true),
                ..Default::default()
            },
            rescan: RescanConfig {
                short_interval_ms: Some(10),
                coalesce_interval_ms: Some(20),
                ..Default::default()
            },
            ..Default::default()
        };
        let over = AppConfig {
            general: GeneralConfig {
                show_hidden: Some(true),
                ..Default::default()
            },
            rescan: RescanConfig {
                short_interval_ms: Some(30),
                ..Default::default()
            },
            ..Default::default()
        };

        let merged = base.merge(&over);
        assert!(merged.show_hidden());
        assert!(merged.single_selection());
        assert_eq!(merged.short_interval(), Duration::from_millis(30));
        assert_eq!(merged.coalesce_interval(), Duration::from_millis(20));
    }

    #[test]
    fn test_merge_none_does_not_clear_some() {
        let base = AppConfig {
            watcher: WatcherConfig {
                enabled: Some(false),
                debounce_ms: Some(500),
                ..Default::default()
            },
            ..Default::default()
        };
        let merged = base.merge(&AppConfig::default());
        assert!(!merged.watcher_enabled());
        assert_eq!(merged.debounce_ms(), 500);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("test-config.toml");
        std::fs::write(
            &cfg_path,
            r#"
[scan]
sort_by = "modified"
"#,
        )
        .expect("write");

        let cfg = load_file(&cfg_path).expect("load");
        assert_eq!(cfg.sort_by(), "modified");
        assert!(cfg.dirs_first());
    }

    #[test]
    fn test_load_missing_file() {
        assert!(load_file(Path::new("/nonexistent/config.toml")).is_none());
    }

    #[test]
    fn test_load_invalid_toml_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("bad.toml");
        std::fs::write(&cfg_path, "this is { not valid toml").expect("write");
        assert!(load_file(&cfg_path).is_none());
    }

    #[test]
    fn test_load_with_cli_overrides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg_path = dir.path().join("config.toml");
        std::fs::write(
            &cfg_path,
            r#"
[general]
show_hidden = true

[watcher]
enabled = true
"#,
        )
        .expect("write");

        let cli_overrides = AppConfig {
            watcher: WatcherConfig {
                enabled: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };

        let cfg = AppConfig::load(Some(&cfg_path), Some(&cli_overrides));
        assert!(!cfg.watcher_enabled());
        assert!(cfg.show_hidden());
    }

    #[test]
    fn test_model_config_conversion() {
        let cfg = AppConfig {
            general: GeneralConfig {
                show_hidden: Some(true),
                ..Default::default()
            },
            rescan: RescanConfig {
                max_auto_retries: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        let model = cfg.model_config();
        assert!(model.show_hidden);
        assert_eq!(model.max_auto_retries, 2);
        assert_eq!(model.short_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_disabled_watcher_starts_paused() {
        let cfg = AppConfig {
            watcher: WatcherConfig {
                enabled: Some(false),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(!cfg.file_watcher().is_active());
        assert!(AppConfig::default().file_watcher().is_active());
    }

    #[test]
    fn test_volume_manager_from_config() {
        let cfg: AppConfig = toml::from_str(
            r#"
[[volumes]]
id = "drive"
root = "/drive"
type = "drive"
"#,
        )
        .expect("parse");
        let volumes = cfg.volume_manager(Path::new("/unused")).expect("volumes");
        let info = volumes
            .volume_info(&Entry::directory("drive", "/drive/docs"))
            .expect("mounted");
        assert!(info.drive_based);
    }

    #[test]
    fn test_volume_manager_rejects_relative_root() {
        let cfg: AppConfig = toml::from_str(
            r#"
[[volumes]]
id = "bad"
root = "relative"
type = "removable"
"#,
        )
        .expect("parse");
        assert!(matches!(
            cfg.volume_manager(Path::new("/unused")),
            Err(ModelError::Config(_))
        ));
    }

    #[test]
    fn test_volume_manager_falls_back_to_single_volume() {
        let dir = tempfile::tempdir().expect("tempdir");
        let volumes = AppConfig::default()
            .volume_manager(dir.path())
            .expect("volumes");
        assert_eq!(volumes.volumes().len(), 1);
        assert_eq!(volumes.volumes()[0].root, dir.path());
    }
}
