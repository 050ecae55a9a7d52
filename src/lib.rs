//! # warmpool
//!
//! **Application-Instance Pool Manager**
//!
//! For each distinct application (identified by its root directory) the
//! pool maintains a small fleet of long-lived worker instances that
//! serve requests. Client code obtains a session through a single entry
//! point; the pool decides whether to reuse an idle instance, spawn a
//! new one, share a busy one, or evict across applications to make
//! room. A background sweeper reclaims instances that stay idle too
//! long, and a per-application restart trigger forces code reloads.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Pool                               │
//! │   get(app_root, options) ──► Checkout ──► release(checkout) │
//! ├─────────────────────────────────────────────────────────────┤
//! │  one mutex over:                                            │
//! │   app groups   app_root ─► [ entry, entry, ... ]            │
//! │                             idle at the head, active after  │
//! │   idle list    longest-idle ─► ... ─► freshest              │
//! │   counters     count / active / waiting                     │
//! │   restart      app_root ─► last trigger mtime               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     Collaborators                           │
//! │   Spawner::spawn(app_root)    ─► AppInstance                │
//! │   AppInstance::connect()      ─► AppSession                 │
//! │   <app_root>/tmp/restart.txt  ─► reload trigger             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Acquisition Semantics
//!
//! - **Reuse first**: an idle instance of the application always wins
//!   over spawning.
//! - **Two capacity axes**: a pool-wide cap (`max`) and an optional
//!   per-application cap (`max_per_app`).
//! - **Overflow**: a full pool either shares the application's
//!   least-loaded instance or, with the global queue enabled, blocks
//!   until a session ends.
//! - **Cross-application eviction**: a new application entering a full
//!   pool evicts the longest-idle instance anywhere.
//! - **Crash retry**: instances that crash while a session is opened on
//!   them are discarded and the acquisition retried a bounded number of
//!   times.
//!
//! Spawning and session establishment run without the pool lock, so one
//! slow application never stalls the others.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use warmpool::{GetOptions, Pool, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> warmpool::Result<()> {
//!     let spawner = Arc::new(MyProcessSpawner::new());
//!     let pool = Pool::new(spawner, PoolConfig::default())?;
//!
//!     let mut checkout = pool.get("/srv/myapp", GetOptions::default()).await?;
//!     // ... drive the session ...
//!     pool.release(checkout).await;
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod constants;
mod error;
mod pool;
mod restart;
pub mod spawner;

pub use error::{Error, Result};
pub use pool::{Checkout, GetOptions, Pool, PoolConfig, PoolStats};
pub use restart::RestartProbe;
pub use spawner::{AppInstance, AppSession, Spawner};
