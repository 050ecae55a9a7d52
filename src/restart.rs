//! Restart trigger probe.
//!
//! Each application root owns exactly one trigger path,
//! `<app_root>/tmp/restart.txt`. Touching that file asks the pool to
//! purge the application's instances and spawn fresh ones on the next
//! acquisition.
//!
//! Delete-on-observe is the preferred signal: the probe removes the file
//! when it sees it, so one touch yields exactly one restart. When the
//! file cannot be removed (read-only mounts), the probe falls back to
//! comparing modification times and reports a restart on every change.

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, warn};

use crate::constants::RESTART_TRIGGER_FILE;

/// Tracks restart triggers per application root.
///
/// The probe records the last observed modification time of each root's
/// trigger file; records are dropped when the trigger is consumed, when
/// the file disappears, or when the pool forgets the root.
#[derive(Debug, Default)]
pub struct RestartProbe {
    recorded: HashMap<PathBuf, SystemTime>,
}

impl RestartProbe {
    /// Creates an empty probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reports whether `app_root` must be reloaded, consuming the
    /// trigger file when possible.
    pub fn needs_restart(&mut self, app_root: &Path) -> bool {
        let trigger = app_root.join(RESTART_TRIGGER_FILE);

        let mtime = match fs::metadata(&trigger) {
            Ok(meta) => meta.modified().ok(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.recorded.remove(app_root);
                return false;
            }
            Err(err) => {
                // Unreadable trigger (permissions, transient fs fault):
                // treat as unobserved rather than restarting in a loop.
                debug!(
                    trigger = %trigger.display(),
                    error = %err,
                    "restart trigger could not be inspected"
                );
                return false;
            }
        };

        match fs::remove_file(&trigger) {
            Ok(()) => {
                self.recorded.remove(app_root);
                true
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                // Another observer consumed it first; the trigger still
                // fired.
                self.recorded.remove(app_root);
                true
            }
            Err(err) => {
                // Undeletable trigger: fall back to mtime comparison.
                let Some(mtime) = mtime else {
                    warn!(
                        trigger = %trigger.display(),
                        error = %err,
                        "restart trigger is undeletable and has no readable mtime"
                    );
                    return true;
                };
                match self.recorded.insert(app_root.to_path_buf(), mtime) {
                    None => true,
                    Some(previous) => previous != mtime,
                }
            }
        }
    }

    /// Drops the record for `app_root`.
    ///
    /// Called when the pool stops hosting the root, so the record table
    /// never outlives the applications it describes.
    pub fn forget(&mut self, app_root: &Path) {
        self.recorded.remove(app_root);
    }

    /// Roots that currently have a recorded trigger mtime.
    #[cfg(test)]
    pub(crate) fn recorded_roots(&self) -> impl Iterator<Item = &Path> {
        self.recorded.keys().map(PathBuf::as_path)
    }
}
