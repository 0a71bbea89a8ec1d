pub mod entry;
pub mod filter;
pub mod metadata;
pub mod scanner;
pub mod volume;
pub mod watcher;
