//! The directory model: a single task that owns the current directory and
//! everything derived from it.

pub mod contents;
pub mod debounce;
pub mod directory_model;
pub mod handle;
pub mod queue;
pub mod selection;

#[cfg(test)]
pub mod testing;

pub use directory_model::{ChangeOutcome, Collaborators, ModelConfig, ModelSnapshot, SearchCallbacks};
pub use handle::{DirectoryChangeTracker, DirectoryModelHandle, PendingChange};
