//! Collaborator seams: the spawner and the instance handle.
//!
//! The pool does not know how worker processes are started, nor what
//! transport carries sessions to them. Both concerns live behind the
//! traits in this module:
//!
//! - [`Spawner`]: produces live [`AppInstance`] handles for an
//!   application root, and is told when a root must be reloaded.
//! - [`AppInstance`]: a running worker; all of its failure surfaces come
//!   through [`AppInstance::connect`] and the spawn call itself.
//! - [`AppSession`]: one client <-> instance conversation. Opaque to the
//!   pool; it is handed back to the caller inside a checkout and its end
//!   is signalled through `Pool::release`.
//!
//! # Thread Safety
//!
//! Implementations must be `Send + Sync`; the pool calls `spawn` and
//! `connect` concurrently from many tasks, without holding its lock.

use crate::error::Result;
use async_trait::async_trait;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;

/// Starts and reloads worker instances for application roots.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Spawns a new live instance rooted at `app_root`.
    ///
    /// May take arbitrary time; the pool releases its lock around this
    /// call so unrelated applications are not blocked. Errors are
    /// surfaced to the caller of `get` as `Error::SpawnFailed`.
    async fn spawn(&self, app_root: &Path) -> Result<Arc<dyn AppInstance>>;

    /// Invoked after a restart trigger purged every instance of
    /// `app_root`, before fresh instances are spawned.
    ///
    /// The default implementation does nothing; spawners that cache
    /// preloaded application code use this to drop it.
    async fn reload(&self, app_root: &Path) {
        let _ = app_root;
    }
}

/// A running worker instance serving one application.
#[async_trait]
pub trait AppInstance: Send + Sync {
    /// Opens a new session on this instance.
    ///
    /// Called without the pool lock held. A failure here marks the
    /// instance as crashed: the pool discards it and retries with a
    /// fresh one.
    async fn connect(&self) -> Result<Box<dyn AppSession>>;

    /// Releases the underlying worker.
    ///
    /// Called exactly once, when the pool retires the instance (idle
    /// expiry, request cap, eviction, restart purge, crash, or
    /// shutdown). The default implementation does nothing.
    async fn dispose(&self) {}
}

/// A single client <-> instance conversation.
///
/// The pool never looks inside a session; it only carries it from
/// `connect` to the caller. `as_any` lets callers recover the concrete
/// session type their spawner produced.
pub trait AppSession: Send {
    /// Downcast support for callers.
    fn as_any(&mut self) -> &mut dyn Any;
}
