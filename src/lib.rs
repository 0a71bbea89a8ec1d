//! Directory scanning and state synchronization for file-manager views.
//!
//! [`model::DirectoryModelHandle`] drives a single background task that owns
//! the current directory, its file list and selection, and keeps them in sync
//! with scans, searches, and filesystem change notifications.

pub mod cancel;
pub mod config;
pub mod error;
pub mod event;
pub mod fs;
pub mod model;

pub use error::{ModelError, Result, ScanError};
pub use event::ModelEvent;
pub use model::{Collaborators, DirectoryModelHandle, ModelConfig, ModelSnapshot};
