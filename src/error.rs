//! Error types for the pool layer.

use std::path::PathBuf;

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the pool layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Acquisition Errors
    // =========================================================================
    /// The spawner failed to produce a live instance.
    #[error("failed to spawn instance for '{}': {reason}", .app_root.display())]
    SpawnFailed { app_root: PathBuf, reason: String },

    /// Instances kept crashing when a session was opened on them.
    #[error(
        "instances for '{}' failed to accept a session after {attempts} attempts: {reason}",
        .app_root.display()
    )]
    ConnectFailed {
        app_root: PathBuf,
        attempts: u32,
        reason: String,
    },

    /// The application root passed to `get` is unusable.
    #[error("invalid application root: {0}")]
    InvalidAppRoot(String),

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A configuration value or setter argument is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// The pool has been shut down; no further sessions can be produced.
    #[error("pool is shutting down")]
    ShuttingDown,

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
