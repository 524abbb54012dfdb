//! Error types for the tail agent.

use crate::table::WatchDescriptor;
use thiserror::Error;

/// The main error type for tail agent operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Reading a tracked file or spawning the event thread failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The notify backend refused to add or remove a watch.
    #[error("Watch backend error: {0}")]
    Watcher(#[from] notify::Error),

    /// The path cannot be tracked, e.g. it is relative.
    #[error("Invalid path: {message}")]
    InvalidPath { message: String },

    /// A watch descriptor the backend never handed out, or already released.
    #[error("Unknown watch descriptor: {descriptor}")]
    UnknownDescriptor { descriptor: WatchDescriptor },

    /// Watch mode only follows files that exist when they are tracked.
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// A global tracing subscriber was already installed.
    #[error("Logging setup failed: {0}")]
    Logging(#[from] tracing_subscriber::util::TryInitError),
}

/// A convenient Result type for tail agent operations.
pub type Result<T> = std::result::Result<T, Error>;
