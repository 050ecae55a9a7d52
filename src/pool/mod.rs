//! The application-instance pool.
//!
//! For each application root the pool keeps a small fleet of long-lived
//! worker instances. [`Pool::get`] hands out sessions, deciding per call
//! whether to reuse an idle instance, spawn a new one, share a busy one,
//! or evict another application's instance to make room. Sessions are
//! returned through [`Pool::release`]; a background sweeper retires
//! instances that stay idle too long.
//!
//! # Locking Model
//!
//! One mutex guards the whole pool state; one notification primitive
//! (`active_changed`) wakes acquisitions blocked on capacity. Spawn and
//! connect calls run without the lock so a slow application cannot stall
//! the rest of the pool; a spawn commit therefore re-validates capacity
//! and rolls the fresh instance back when another task filled the pool
//! in the meantime. Waiters always restart the full decision tree after
//! waking: no fairness is promised among them.

mod state;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_CLEAN_INTERVAL, DEFAULT_MAX_IDLE_TIME, DEFAULT_MAX_PER_APP, DEFAULT_MAX_POOL_SIZE,
    DEFAULT_USE_GLOBAL_QUEUE, MAX_GET_ATTEMPTS,
};
use crate::error::{Error, Result};
use crate::spawner::{AppInstance, AppSession, Spawner};

use state::{EntryId, PoolState};

// =============================================================================
// Configuration
// =============================================================================

/// Initial pool configuration.
///
/// Every knob can also be changed on a running pool through the setters;
/// changes take effect on the next acquisition or sweep decision.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum instances across all applications. Must be at least 1.
    pub max: usize,
    /// Per-application instance cap (0 = no per-application cap).
    pub max_per_app: usize,
    /// When the pool is full, block for a free slot instead of sharing
    /// the least-loaded instance.
    pub use_global_queue: bool,
    /// Idle lifetime before the sweeper retires an instance
    /// (zero disables idle expiry).
    pub max_idle_time: Duration,
    /// Sweeper scan interval. Must be non-zero.
    pub clean_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max: DEFAULT_MAX_POOL_SIZE,
            max_per_app: DEFAULT_MAX_PER_APP,
            use_global_queue: DEFAULT_USE_GLOBAL_QUEUE,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            clean_interval: DEFAULT_CLEAN_INTERVAL,
        }
    }
}

impl PoolConfig {
    fn validate(&self) -> Result<()> {
        if self.max == 0 {
            return Err(Error::InvalidConfig("max must be at least 1".to_string()));
        }
        if self.clean_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "clean_interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-acquisition options.
#[derive(Debug, Clone, Default)]
pub struct GetOptions {
    /// Requests an instance of this application may process before it is
    /// retired (0 = unbounded). Only the first acquisition for a root
    /// seeds the value; it stays in force until the application's last
    /// instance leaves the pool.
    pub max_requests: u64,
}

/// Point-in-time pool counters for monitoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Total instances in the pool.
    pub count: usize,
    /// Instances with at least one open session.
    pub active: usize,
    /// Instances with no open session.
    pub idle: usize,
    /// Acquisitions currently blocked on the global queue.
    pub waiting_on_global_queue: usize,
    /// Configured pool-wide instance cap.
    pub max: usize,
    /// Configured per-application cap (0 = none).
    pub max_per_app: usize,
    /// Application groups currently hosted.
    pub groups: usize,
    /// Spawner invocations that produced an instance, including ones
    /// later discarded by crash handling or commit rollback.
    pub spawns_total: u64,
}

// =============================================================================
// Checkout
// =============================================================================

/// A live session checked out of the pool.
///
/// Hand it back with [`Pool::release`] when the conversation ends;
/// consuming the checkout there makes double release unrepresentable.
pub struct Checkout {
    entry: EntryId,
    instance_name: String,
    app_root: PathBuf,
    session: Box<dyn AppSession>,
}

impl Checkout {
    /// The session carried by this checkout.
    pub fn session(&mut self) -> &mut dyn AppSession {
        self.session.as_mut()
    }

    /// Name of the instance serving this session, for log correlation.
    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Application root this session belongs to.
    pub fn app_root(&self) -> &Path {
        &self.app_root
    }
}

impl std::fmt::Debug for Checkout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkout")
            .field("instance", &self.instance_name)
            .field("app_root", &self.app_root)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Pool
// =============================================================================

struct Shared {
    state: Mutex<PoolState>,
    active_changed: Notify,
    spawner: Arc<dyn Spawner>,
}

/// The application-instance pool.
pub struct Pool {
    shared: Arc<Shared>,
    shutdown_tx: watch::Sender<bool>,
    sweeper: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Outcome of one pass through the acquisition decision tree, computed
/// under the lock and acted on after it is dropped.
enum Decision {
    /// An existing instance was selected and its session count bumped.
    Ready {
        id: EntryId,
        name: String,
        instance: Arc<dyn AppInstance>,
    },
    /// A restart trigger fired; the group was purged under the lock and
    /// these instances await disposal.
    Purge { victims: Vec<Arc<dyn AppInstance>> },
    /// Capacity is exhausted; block until `active` changes and retry.
    /// `queued` marks waits that were counted on the global queue.
    Wait { queued: bool },
    /// Spawn a new instance, after disposing an evicted one if room had
    /// to be made.
    Spawn {
        evicted: Option<Arc<dyn AppInstance>>,
    },
}

impl Pool {
    /// Creates a pool and starts its idle sweeper.
    ///
    /// Must be called within a Tokio runtime; the sweeper runs as a
    /// background task until [`Pool::shutdown`] or drop.
    pub fn new(spawner: Arc<dyn Spawner>, config: PoolConfig) -> Result<Self> {
        config.validate()?;
        let shared = Arc::new(Shared {
            state: Mutex::new(PoolState::new(&config)),
            active_changed: Notify::new(),
            spawner,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_loop(Arc::clone(&shared), shutdown_rx));
        Ok(Self {
            shared,
            shutdown_tx,
            sweeper: std::sync::Mutex::new(Some(sweeper)),
        })
    }

    /// Obtains a session for `app_root`, blocking while the pool is at
    /// capacity.
    ///
    /// Instances that crash while a session is opened on them are
    /// discarded and the acquisition retried, up to
    /// [`MAX_GET_ATTEMPTS`](crate::constants::MAX_GET_ATTEMPTS) times.
    /// The returned checkout never wraps an instance that was observed
    /// to crash.
    pub async fn get(&self, app_root: impl AsRef<Path>, options: GetOptions) -> Result<Checkout> {
        let app_root = app_root.as_ref();
        if app_root.as_os_str().is_empty() {
            return Err(Error::InvalidAppRoot(
                "application root must not be empty".to_string(),
            ));
        }
        let mut attempts: u32 = 0;
        loop {
            let (id, name, instance) = self.select_or_spawn(app_root, &options).await?;
            match instance.connect().await {
                Ok(session) => {
                    debug!(
                        app = %app_root.display(),
                        instance = %name,
                        "session established"
                    );
                    return Ok(Checkout {
                        entry: id,
                        instance_name: name,
                        app_root: app_root.to_path_buf(),
                        session,
                    });
                }
                Err(err) => {
                    attempts += 1;
                    warn!(
                        app = %app_root.display(),
                        instance = %name,
                        attempt = attempts,
                        error = %err,
                        "instance crashed while opening a session"
                    );
                    self.shared.state.lock().await.discard_failed(id);
                    self.shared.active_changed.notify_waiters();
                    instance.dispose().await;
                    if attempts >= MAX_GET_ATTEMPTS {
                        return Err(Error::ConnectFailed {
                            app_root: app_root.to_path_buf(),
                            attempts,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Ends a session and returns its instance to the pool.
    ///
    /// The instance becomes reusable (or idle) again, or is retired when
    /// it reached its application's request cap. Releasing a session
    /// whose instance was purged while the session was in flight is a
    /// silent no-op.
    pub async fn release(&self, checkout: Checkout) {
        let Checkout {
            entry,
            instance_name,
            app_root,
            session,
        } = checkout;
        drop(session);
        let retired = self.shared.state.lock().await.release_entry(entry);
        self.shared.active_changed.notify_waiters();
        if let Some(instance) = retired {
            debug!(
                app = %app_root.display(),
                instance = %instance_name,
                "disposing retired instance"
            );
            instance.dispose().await;
        }
    }

    /// Point-in-time counters.
    pub async fn stats(&self) -> PoolStats {
        self.shared.state.lock().await.stats()
    }

    /// Changes the pool-wide instance cap. Rejects zero.
    ///
    /// Lowering the cap never kills running instances; the pool drains
    /// toward the new cap through releases, sweeps, and evictions.
    pub async fn set_max(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::InvalidConfig("max must be at least 1".to_string()));
        }
        self.shared.state.lock().await.max = max;
        self.shared.active_changed.notify_waiters();
        Ok(())
    }

    /// Changes the per-application instance cap (0 = no cap).
    pub async fn set_max_per_app(&self, max_per_app: usize) {
        self.shared.state.lock().await.max_per_app = max_per_app;
        self.shared.active_changed.notify_waiters();
    }

    /// Switches between blocking on a full pool and sharing the
    /// least-loaded instance.
    pub async fn set_use_global_queue(&self, use_global_queue: bool) {
        self.shared.state.lock().await.use_global_queue = use_global_queue;
        self.shared.active_changed.notify_waiters();
    }

    /// Changes the idle lifetime (zero disables idle expiry).
    pub async fn set_max_idle_time(&self, max_idle_time: Duration) {
        self.shared.state.lock().await.max_idle_time = max_idle_time;
    }

    /// Changes the sweeper scan interval. Rejects zero.
    pub async fn set_clean_interval(&self, clean_interval: Duration) -> Result<()> {
        if clean_interval.is_zero() {
            return Err(Error::InvalidConfig(
                "clean_interval must be non-zero".to_string(),
            ));
        }
        self.shared.state.lock().await.clean_interval = clean_interval;
        Ok(())
    }

    /// Shuts the pool down: stops the sweeper, disposes every instance,
    /// and fails blocked and future acquisitions with
    /// [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        info!("pool shutting down");
        let _ = self.shutdown_tx.send(true);
        let victims = {
            let mut state = self.shared.state.lock().await;
            state.shutting_down = true;
            state.drain_all()
        };
        self.shared.active_changed.notify_waiters();
        for victim in victims {
            victim.dispose().await;
        }
        let handle = self.sweeper.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Runs the decision tree until an instance is selected or spawned.
    ///
    /// Returns with the entry's session count already incremented; the
    /// caller connects outside the lock and rolls the entry back through
    /// `discard_failed` if the connect crashes.
    async fn select_or_spawn(
        &self,
        app_root: &Path,
        options: &GetOptions,
    ) -> Result<(EntryId, String, Arc<dyn AppInstance>)> {
        loop {
            let mut state = self.shared.state.lock().await;
            if state.shutting_down {
                return Err(Error::ShuttingDown);
            }

            match Self::decide(&mut state, app_root) {
                Decision::Ready { id, name, instance } => {
                    drop(state);
                    return Ok((id, name, instance));
                }
                Decision::Purge { victims } => {
                    drop(state);
                    self.shared.active_changed.notify_waiters();
                    self.shared.spawner.reload(app_root).await;
                    for victim in victims {
                        victim.dispose().await;
                    }
                }
                Decision::Wait { queued } => {
                    // Register for the wakeup before the lock is dropped
                    // so a release landing in between cannot be missed.
                    let notified = self.shared.active_changed.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();
                    drop(state);
                    notified.await;
                    if queued {
                        self.shared.state.lock().await.waiting_on_global_queue -= 1;
                    }
                }
                Decision::Spawn { evicted } => {
                    drop(state);
                    if let Some(victim) = evicted {
                        victim.dispose().await;
                    }
                    info!(app = %app_root.display(), "spawning instance");
                    let instance = self.shared.spawner.spawn(app_root).await?;
                    let mut state = self.shared.state.lock().await;
                    state.spawns_total += 1;
                    if state.shutting_down {
                        drop(state);
                        instance.dispose().await;
                        return Err(Error::ShuttingDown);
                    }
                    let over_global = state.count >= state.max;
                    let over_app = state.max_per_app != 0
                        && state.group_size(app_root) >= state.max_per_app;
                    if over_global || over_app {
                        // Another task filled the pool while the spawner
                        // ran; the decision is stale.
                        drop(state);
                        debug!(
                            app = %app_root.display(),
                            "pool filled during spawn; discarding fresh instance"
                        );
                        instance.dispose().await;
                        continue;
                    }
                    let (id, name) =
                        state.insert_spawned(app_root, Arc::clone(&instance), options.max_requests);
                    drop(state);
                    return Ok((id, name, instance));
                }
            }
        }
    }

    /// One pass through the decision tree, entirely under the lock.
    fn decide(state: &mut PoolState, app_root: &Path) -> Decision {
        if state.has_group(app_root) && state.restart.needs_restart(app_root) {
            info!(
                app = %app_root.display(),
                "restart trigger observed; purging instances"
            );
            let victims = state.purge_group(app_root);
            return Decision::Purge { victims };
        }

        if state.has_group(app_root) {
            if let Some((id, name, instance)) = state.reuse_idle_head(app_root) {
                return Decision::Ready { id, name, instance };
            }
            let at_capacity = state.count >= state.max
                || (state.max_per_app != 0 && state.group_size(app_root) >= state.max_per_app);
            if at_capacity {
                if state.use_global_queue {
                    state.waiting_on_global_queue += 1;
                    debug!(
                        app = %app_root.display(),
                        waiting = state.waiting_on_global_queue,
                        "pool full; queueing for a free slot"
                    );
                    return Decision::Wait { queued: true };
                }
                return match state.checkout_least_loaded(app_root) {
                    Some((id, name, instance)) => Decision::Ready { id, name, instance },
                    None => Decision::Wait { queued: false },
                };
            }
            return Decision::Spawn { evicted: None };
        }

        if state.active >= state.max {
            debug!(
                app = %app_root.display(),
                active = state.active,
                "pool saturated with active instances; waiting"
            );
            return Decision::Wait { queued: false };
        }
        if state.count >= state.max {
            return match state.evict_longest_idle() {
                Some(victim) => Decision::Spawn {
                    evicted: Some(victim),
                },
                None => Decision::Wait { queued: false },
            };
        }
        Decision::Spawn { evicted: None }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Dropping the watch sender is enough to stop the sweeper; send
        // an explicit signal for the case where the pool is dropped
        // while the sweeper is mid-scan.
        let _ = self.shutdown_tx.send(true);
    }
}

// =============================================================================
// Sweeper
// =============================================================================

/// Background loop retiring instances that stay idle past the limit.
async fn sweep_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let interval = shared.state.lock().await.clean_interval;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown_rx.changed() => {
                debug!("idle sweeper stopping");
                return;
            }
        }
        let victims = shared.state.lock().await.sweep_expired();
        for victim in victims {
            victim.dispose().await;
        }
    }
}
