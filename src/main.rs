use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dirmodel::config::{AppConfig, GeneralConfig, WatcherConfig};
use dirmodel::fs::entry::Entry;
use dirmodel::fs::metadata::MetadataCache;
use dirmodel::fs::scanner::LocalScanner;
use dirmodel::fs::volume::LocalVolumeManager;
use dirmodel::model::{ChangeOutcome, SearchCallbacks};
use dirmodel::{
    Collaborators, DirectoryModelHandle, ModelError, ModelEvent, ModelSnapshot, Result,
};

/// List a directory through the directory model, optionally searching it and
/// following filesystem changes.
#[derive(Parser, Debug)]
#[command(name = "dirmodel", version, about)]
struct Cli {
    /// Directory to open (defaults to the configured path, then ".")
    path: Option<PathBuf>,

    /// Search the directory for file names containing QUERY
    #[arg(long, value_name = "QUERY")]
    search: Option<String>,

    /// Keep running and print model events until Ctrl-C
    #[arg(long)]
    watch: bool,

    /// Include hidden entries
    #[arg(long)]
    show_hidden: bool,

    /// Path to a config file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Disable filesystem watcher (auto-refresh)
    #[arg(long)]
    no_watcher: bool,
}

impl Cli {
    fn overrides(&self) -> AppConfig {
        AppConfig {
            general: GeneralConfig {
                show_hidden: self.show_hidden.then_some(true),
                ..Default::default()
            },
            watcher: WatcherConfig {
                enabled: self.no_watcher.then_some(false),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("dirmodel=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref(), Some(&cli.overrides()));

    let requested = cli
        .path
        .clone()
        .or_else(|| config.general.default_path.as_ref().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("."));
    let path = requested.canonicalize().map_err(|_| {
        ModelError::InvalidPath(format!("{} does not exist", requested.display()))
    })?;

    let volumes = config.volume_manager(&path)?;
    let directory = entry_for(&volumes, &path)?;

    let watcher = config.file_watcher();
    if !watcher.is_active() {
        info!("Filesystem watcher disabled");
    }
    let collaborators = Collaborators {
        volumes: Arc::new(volumes),
        metadata: Arc::new(MetadataCache::new()),
        scanner: Arc::new(LocalScanner::new(config.scan_options())),
        watcher: Arc::new(watcher),
    };
    let model = DirectoryModelHandle::spawn(collaborators, config.model_config());
    let mut events = model.subscribe();

    match model.change_directory_entry(directory)?.outcome().await {
        ChangeOutcome::Loaded => {}
        ChangeOutcome::Failed(error) => warn!(%error, "Listing failed"),
        other => {
            return Err(ModelError::InvalidPath(format!(
                "{}: {:?}",
                path.display(),
                other
            )))
        }
    }

    if let Some(query) = cli.search.as_deref() {
        let mut search_events = model.subscribe();
        let logged_query = query.to_string();
        model.search(
            query,
            SearchCallbacks::new()
                .on_rescan(move || info!(query = %logged_query, "Search results loaded")),
        )?;
        loop {
            match search_events.next().await? {
                ModelEvent::ScanCompleted { .. } => break,
                ModelEvent::ScanFailed { error, .. } => {
                    warn!(query, %error, "Search failed");
                    break;
                }
                ModelEvent::ScanCancelled { .. } => break,
                _ => {}
            }
        }
    }

    model.wait_idle().await?;
    print_snapshot(&model.snapshot().await?);

    if cli.watch {
        events.drain();
        loop {
            tokio::select! {
                event = events.next() => {
                    let event = event?;
                    println!("event: {}", event.name());
                    if matches!(
                        event,
                        ModelEvent::ScanCompleted { .. } | ModelEvent::RescanCompleted { .. }
                    ) {
                        print_snapshot(&model.snapshot().await?);
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    break;
                }
            }
        }
    }

    model.dispose()?;
    Ok(())
}

/// Map a path onto the volume whose root contains it most closely.
fn entry_for(volumes: &LocalVolumeManager, path: &Path) -> Result<Entry> {
    volumes
        .volumes()
        .into_iter()
        .filter(|v| path.starts_with(&v.root))
        .max_by_key(|v| v.root.components().count())
        .map(|v| Entry::directory(&v.id, path))
        .ok_or_else(|| {
            ModelError::Config(format!("{} is not inside a configured volume", path.display()))
        })
}

fn print_snapshot(snapshot: &ModelSnapshot) {
    if let Some(dir) = &snapshot.current_directory {
        println!("{}", dir.path().display());
    }
    if !snapshot.last_search_query.is_empty() {
        println!("search: {}", snapshot.last_search_query);
    }
    for (index, entry) in snapshot.files.iter().enumerate() {
        let marker = if snapshot.selected_indexes.contains(&index) { '*' } else { ' ' };
        let suffix = if entry.is_directory() { "/" } else { "" };
        println!("{} {}{}", marker, entry.name(), suffix);
    }
    if snapshot.scan_failures > 0 {
        println!("({} consecutive scan failures)", snapshot.scan_failures);
    }
}
