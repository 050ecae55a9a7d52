//! Constants for the pool core.
//!
//! All limits, timeouts, and well-known paths are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Acquisition
// =============================================================================

/// Maximum attempts a single `get` makes when instances crash on connect.
///
/// Each attempt selects or spawns an instance and tries to open a session
/// on it; a crashed instance is discarded and the attempt repeated up to
/// this bound before the failure is surfaced to the caller.
pub const MAX_GET_ATTEMPTS: u32 = 10;

// =============================================================================
// Capacity Defaults
// =============================================================================

/// Default maximum number of instances across all applications.
pub const DEFAULT_MAX_POOL_SIZE: usize = 6;

/// Default per-application instance cap (0 = no per-application cap).
pub const DEFAULT_MAX_PER_APP: usize = 0;

/// Whether overflow acquisitions block for a free slot by default.
///
/// When disabled, an acquisition that finds the pool full shares the
/// least-loaded instance of its application instead of waiting.
pub const DEFAULT_USE_GLOBAL_QUEUE: bool = false;

// =============================================================================
// Idle Reclamation
// =============================================================================

/// How long an instance may sit idle before the sweeper retires it.
/// A value of zero disables idle expiry.
pub const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(300);

/// How often the background sweeper scans for expired idle instances.
pub const DEFAULT_CLEAN_INTERVAL: Duration = Duration::from_secs(60);

// =============================================================================
// Restart Trigger
// =============================================================================

/// Path of the restart trigger file, relative to an application root.
///
/// Touching this file forces a reload: the next acquisition for the root
/// purges its instances and spawns fresh ones.
pub const RESTART_TRIGGER_FILE: &str = "tmp/restart.txt";
