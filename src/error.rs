use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, ModelError>;

/// Errors surfaced by the directory model and its local collaborators.
#[derive(Debug, Error)]
pub enum ModelError {
    /// I/O errors from filesystem operations.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid path provided by the user.
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// The model task has shut down and no longer accepts commands.
    #[error("Directory model is no longer running")]
    ModelStopped,

    /// The current directory changed while an operation was in flight.
    #[error("Current directory changed during the operation")]
    DirectoryChanged,

    /// Filesystem watcher setup errors.
    #[error("Watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Configuration errors (bad volume definitions and the like).
    #[error("Config error: {0}")]
    Config(String),
}

/// Why a scan did not complete.
///
/// Scan errors travel inside broadcast events, so they are `Clone` and keep
/// only the rendered message of the underlying I/O error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("Not found: {0}")]
    NotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },

    /// The volume backing the directory went away. Never retried automatically.
    #[error("Volume disconnected: {0}")]
    VolumeDisconnected(String),

    #[error("Unsupported contents: {0}")]
    Unsupported(String),

    #[error("Scan cancelled")]
    Cancelled,
}

impl ScanError {
    /// Map an I/O error hit while reading `path`.
    pub fn from_io(path: impl Into<PathBuf>, err: &io::Error) -> Self {
        let path = path.into();
        match err.kind() {
            io::ErrorKind::NotFound => ScanError::NotFound(path),
            io::ErrorKind::PermissionDenied => ScanError::PermissionDenied(path),
            _ => ScanError::Io {
                path,
                message: err.to_string(),
            },
        }
    }

    pub fn is_volume_disconnected(&self) -> bool {
        matches!(self, ScanError::VolumeDisconnected(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let err: ModelError = io_err.into();
        assert!(matches!(err, ModelError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn invalid_path_error_display() {
        let err = ModelError::InvalidPath("/nonexistent".into());
        assert_eq!(err.to_string(), "Invalid path: /nonexistent");
    }

    #[test]
    fn scan_error_from_io_maps_kinds() {
        let not_found = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(
            ScanError::from_io("/a", &not_found),
            ScanError::NotFound(PathBuf::from("/a"))
        );

        let denied = io::Error::new(io::ErrorKind::PermissionDenied, "nope");
        assert_eq!(
            ScanError::from_io("/b", &denied),
            ScanError::PermissionDenied(PathBuf::from("/b"))
        );

        let other = io::Error::new(io::ErrorKind::Other, "disk on fire");
        let err = ScanError::from_io("/c", &other);
        assert!(matches!(err, ScanError::Io { .. }));
        assert!(err.to_string().contains("disk on fire"));
    }

    #[test]
    fn only_disconnect_is_flagged() {
        assert!(ScanError::VolumeDisconnected("usb".into()).is_volume_disconnected());
        assert!(!ScanError::Cancelled.is_volume_disconnected());
        assert!(!ScanError::NotFound(PathBuf::from("/x")).is_volume_disconnected());
    }
}
