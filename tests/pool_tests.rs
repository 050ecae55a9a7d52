//! Integration tests for pool acquisition and release.
//!
//! These drive the public `Pool` API against a scripted spawner that
//! counts spawns, fails connects on demand, and records disposals, so
//! every lifecycle path (reuse, overflow, queueing, eviction, restart,
//! request cap, crash retry) is observable from the outside.

use std::any::Any;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use warmpool::constants::{MAX_GET_ATTEMPTS, RESTART_TRIGGER_FILE};
use warmpool::{
    AppInstance, AppSession, Error, GetOptions, Pool, PoolConfig, Result, Spawner,
};

// =============================================================================
// Test Helpers
// =============================================================================

struct TestSession;

impl AppSession for TestSession {
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

struct TestInstance {
    connect_failures: Arc<AtomicU64>,
    disposals: Arc<AtomicU64>,
}

#[async_trait]
impl AppInstance for TestInstance {
    async fn connect(&self) -> Result<Box<dyn AppSession>> {
        let fail = self
            .connect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "worker crashed during handshake",
            )));
        }
        Ok(Box::new(TestSession))
    }

    async fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scripted spawner: counts spawns and reloads, and can be told to fail
/// the next N spawns or the next N connects (across all its instances).
struct TestSpawner {
    spawns: AtomicU64,
    reloads: AtomicU64,
    spawn_failures: AtomicU64,
    connect_failures: Arc<AtomicU64>,
    disposals: Arc<AtomicU64>,
}

impl TestSpawner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            spawns: AtomicU64::new(0),
            reloads: AtomicU64::new(0),
            spawn_failures: AtomicU64::new(0),
            connect_failures: Arc::new(AtomicU64::new(0)),
            disposals: Arc::new(AtomicU64::new(0)),
        })
    }

    fn spawn_count(&self) -> u64 {
        self.spawns.load(Ordering::SeqCst)
    }

    fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    fn disposal_count(&self) -> u64 {
        self.disposals.load(Ordering::SeqCst)
    }

    fn fail_next_connects(&self, n: u64) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    fn fail_next_spawns(&self, n: u64) {
        self.spawn_failures.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl Spawner for TestSpawner {
    async fn spawn(&self, app_root: &Path) -> Result<Arc<dyn AppInstance>> {
        let fail = self
            .spawn_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::SpawnFailed {
                app_root: app_root.to_path_buf(),
                reason: "scripted spawn failure".to_string(),
            });
        }
        self.spawns.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(TestInstance {
            connect_failures: Arc::clone(&self.connect_failures),
            disposals: Arc::clone(&self.disposals),
        }))
    }

    async fn reload(&self, _app_root: &Path) {
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }
}

fn pool_with(spawner: Arc<TestSpawner>, config: PoolConfig) -> Pool {
    Pool::new(spawner, config).expect("valid pool config")
}

fn config_max(max: usize) -> PoolConfig {
    PoolConfig {
        max,
        ..PoolConfig::default()
    }
}

// =============================================================================
// Reuse and Spawn
// =============================================================================

#[tokio::test]
async fn released_instance_is_reused() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(2));

    let s1 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    let first = s1.instance_name().to_string();
    pool.release(s1).await;

    let s2 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    assert_eq!(s2.instance_name(), first, "idle instance is reused");
    assert_eq!(spawner.spawn_count(), 1);

    let stats = pool.stats().await;
    assert_eq!(stats.count, 1);
    assert_eq!(stats.active, 1);
    pool.release(s2).await;
}

#[tokio::test]
async fn concurrent_sessions_spawn_up_to_capacity() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(3));

    let s1 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    let s2 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    let s3 = pool.get("/srv/app", GetOptions::default()).await.unwrap();

    assert_eq!(spawner.spawn_count(), 3);
    let stats = pool.stats().await;
    assert_eq!(stats.count, 3);
    assert_eq!(stats.active, 3);
    assert_eq!(stats.idle, 0);
    assert_ne!(s1.instance_name(), s2.instance_name());
    assert_ne!(s2.instance_name(), s3.instance_name());

    for s in [s1, s2, s3] {
        pool.release(s).await;
    }
    let stats = pool.stats().await;
    assert_eq!(stats.active, 0);
    assert_eq!(stats.idle, 3);
}

#[tokio::test]
async fn session_downcasts_to_spawner_type() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(1));

    let mut s1 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    assert!(s1.session().as_any().downcast_mut::<TestSession>().is_some());
    pool.release(s1).await;
}

// =============================================================================
// Overflow
// =============================================================================

#[tokio::test]
async fn full_pool_shares_instance_without_global_queue() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(1));

    let s1 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    let s2 = pool.get("/srv/app", GetOptions::default()).await.unwrap();

    assert_eq!(spawner.spawn_count(), 1, "no second spawn on overflow");
    assert_eq!(s1.instance_name(), s2.instance_name());
    let stats = pool.stats().await;
    assert_eq!(stats.count, 1);
    assert_eq!(stats.active, 1);

    pool.release(s1).await;
    pool.release(s2).await;
}

#[tokio::test]
async fn per_app_cap_limits_one_application() {
    let spawner = TestSpawner::new();
    let pool = pool_with(
        Arc::clone(&spawner),
        PoolConfig {
            max: 10,
            max_per_app: 1,
            ..PoolConfig::default()
        },
    );

    let s1 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    let s2 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    assert_eq!(s1.instance_name(), s2.instance_name());
    assert_eq!(spawner.spawn_count(), 1);

    // A different application is not constrained by the first one's cap.
    let s3 = pool.get("/srv/other", GetOptions::default()).await.unwrap();
    assert_eq!(spawner.spawn_count(), 2);

    for s in [s1, s2, s3] {
        pool.release(s).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn global_queue_blocks_until_a_session_ends() {
    let spawner = TestSpawner::new();
    let pool = Arc::new(pool_with(
        Arc::clone(&spawner),
        PoolConfig {
            max: 1,
            use_global_queue: true,
            ..PoolConfig::default()
        },
    ));

    let s1 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    let first = s1.instance_name().to_string();

    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get("/srv/app", GetOptions::default()).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(pool.stats().await.waiting_on_global_queue, 1);

    pool.release(s1).await;
    let s2 = waiter.await.expect("waiter joins").expect("get succeeds");
    assert_eq!(s2.instance_name(), first, "waiter reuses the freed instance");
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(pool.stats().await.waiting_on_global_queue, 0);
    pool.release(s2).await;
}

// =============================================================================
// Eviction
// =============================================================================

#[tokio::test]
async fn new_application_evicts_longest_idle() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(1));

    let s1 = pool.get("/srv/alpha", GetOptions::default()).await.unwrap();
    pool.release(s1).await;

    let s2 = pool.get("/srv/beta", GetOptions::default()).await.unwrap();
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(spawner.disposal_count(), 1, "evicted instance disposed");

    let stats = pool.stats().await;
    assert_eq!(stats.count, 1);
    assert_eq!(stats.groups, 1, "alpha's group is gone");
    pool.release(s2).await;
}

// =============================================================================
// Restart Trigger
// =============================================================================

#[tokio::test]
async fn restart_trigger_purges_and_respawns() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().to_path_buf();

    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(2));

    let s1 = pool.get(&root, GetOptions::default()).await.unwrap();
    let first = s1.instance_name().to_string();
    pool.release(s1).await;

    let trigger = root.join(RESTART_TRIGGER_FILE);
    std::fs::create_dir_all(trigger.parent().unwrap()).unwrap();
    std::fs::write(&trigger, b"restart").unwrap();

    let s2 = pool.get(&root, GetOptions::default()).await.unwrap();
    assert_ne!(s2.instance_name(), first, "purged instance is not reused");
    assert_eq!(spawner.reload_count(), 1);
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(spawner.disposal_count(), 1, "old instance disposed");
    let second = s2.instance_name().to_string();
    pool.release(s2).await;

    // The trigger was consumed; the next acquisition does not re-purge.
    let s3 = pool.get(&root, GetOptions::default()).await.unwrap();
    assert_eq!(s3.instance_name(), second);
    assert_eq!(spawner.spawn_count(), 2);
    assert_eq!(spawner.reload_count(), 1);
    pool.release(s3).await;
}

// =============================================================================
// Request Cap
// =============================================================================

#[tokio::test]
async fn request_cap_retires_after_exactly_k_releases() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(2));
    let options = GetOptions { max_requests: 3 };

    let mut first = String::new();
    for cycle in 0..3 {
        let s = pool.get("/srv/app", options.clone()).await.unwrap();
        if cycle == 0 {
            first = s.instance_name().to_string();
        } else {
            assert_eq!(s.instance_name(), first, "same instance until the cap");
        }
        pool.release(s).await;
    }
    assert_eq!(spawner.spawn_count(), 1);
    assert_eq!(spawner.disposal_count(), 1, "retired on the third release");
    assert_eq!(pool.stats().await.count, 0);

    let s4 = pool.get("/srv/app", options).await.unwrap();
    assert_ne!(s4.instance_name(), first);
    assert_eq!(spawner.spawn_count(), 2);
    pool.release(s4).await;
}

// =============================================================================
// Crash Retry
// =============================================================================

#[tokio::test]
async fn crashed_instances_are_retried() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(2));

    spawner.fail_next_connects(2);
    let s = pool.get("/srv/app", GetOptions::default()).await.unwrap();

    assert_eq!(spawner.spawn_count(), 3, "two crashes, then success");
    assert_eq!(spawner.disposal_count(), 2, "crashed instances disposed");
    let stats = pool.stats().await;
    assert_eq!(stats.count, 1);
    assert_eq!(stats.active, 1);
    pool.release(s).await;
}

#[tokio::test]
async fn connect_failures_exhaust_attempts() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(2));

    spawner.fail_next_connects(u64::MAX);
    let err = pool
        .get("/srv/app", GetOptions::default())
        .await
        .expect_err("every connect crashes");
    match err {
        Error::ConnectFailed { attempts, .. } => {
            assert_eq!(attempts, MAX_GET_ATTEMPTS);
        }
        other => panic!("expected ConnectFailed, got {other}"),
    }
    assert_eq!(spawner.spawn_count(), u64::from(MAX_GET_ATTEMPTS));
    assert_eq!(pool.stats().await.count, 0, "no crashed instance lingers");
}

#[tokio::test]
async fn spawn_failure_propagates_immediately() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(2));

    spawner.fail_next_spawns(1);
    let err = pool
        .get("/srv/app", GetOptions::default())
        .await
        .expect_err("spawn fails");
    assert!(matches!(err, Error::SpawnFailed { .. }));

    // The failure is not sticky.
    let s = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    pool.release(s).await;
}

// =============================================================================
// Sweeper
// =============================================================================

#[tokio::test]
async fn sweeper_retires_long_idle_instances() {
    let spawner = TestSpawner::new();
    let pool = pool_with(
        Arc::clone(&spawner),
        PoolConfig {
            max: 2,
            max_idle_time: Duration::from_millis(40),
            clean_interval: Duration::from_millis(20),
            ..PoolConfig::default()
        },
    );

    let s = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    pool.release(s).await;
    assert_eq!(pool.stats().await.count, 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = pool.stats().await;
    assert_eq!(stats.count, 0, "idle instance swept");
    assert_eq!(stats.groups, 0);
    assert_eq!(spawner.disposal_count(), 1);
}

#[tokio::test]
async fn zero_idle_time_disables_expiry() {
    let spawner = TestSpawner::new();
    let pool = pool_with(
        Arc::clone(&spawner),
        PoolConfig {
            max: 2,
            max_idle_time: Duration::ZERO,
            clean_interval: Duration::from_millis(20),
            ..PoolConfig::default()
        },
    );

    let s = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    pool.release(s).await;
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(pool.stats().await.count, 1, "instance kept warm");
}

// =============================================================================
// Configuration and Shutdown
// =============================================================================

#[tokio::test]
async fn invalid_configuration_is_rejected() {
    let spawner = TestSpawner::new();
    assert!(matches!(
        Pool::new(Arc::clone(&spawner) as Arc<dyn Spawner>, config_max(0)),
        Err(Error::InvalidConfig(_))
    ));

    let pool = pool_with(Arc::clone(&spawner), config_max(2));
    assert!(matches!(pool.set_max(0).await, Err(Error::InvalidConfig(_))));
    assert!(matches!(
        pool.set_clean_interval(Duration::ZERO).await,
        Err(Error::InvalidConfig(_))
    ));
    assert!(pool.set_max(8).await.is_ok());
}

#[tokio::test]
async fn empty_app_root_is_rejected() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(2));
    let err = pool
        .get(PathBuf::new(), GetOptions::default())
        .await
        .expect_err("empty root");
    assert!(matches!(err, Error::InvalidAppRoot(_)));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_drains_and_fails_waiters() {
    let spawner = TestSpawner::new();
    let pool = Arc::new(pool_with(
        Arc::clone(&spawner),
        PoolConfig {
            max: 1,
            use_global_queue: true,
            ..PoolConfig::default()
        },
    ));

    let s1 = pool.get("/srv/app", GetOptions::default()).await.unwrap();
    let waiter = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.get("/srv/app", GetOptions::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    pool.shutdown().await;
    assert!(matches!(
        waiter.await.expect("waiter joins"),
        Err(Error::ShuttingDown)
    ));
    assert!(matches!(
        pool.get("/srv/app", GetOptions::default()).await,
        Err(Error::ShuttingDown)
    ));
    assert_eq!(pool.stats().await.count, 0);
    assert_eq!(spawner.disposal_count(), 1);

    // Releasing a session that outlived the shutdown is a silent no-op.
    pool.release(s1).await;
    assert_eq!(pool.stats().await.count, 0);
}

#[tokio::test]
async fn stats_serialize_round_trip() {
    let spawner = TestSpawner::new();
    let pool = pool_with(Arc::clone(&spawner), config_max(3));
    let s = pool.get("/srv/app", GetOptions::default()).await.unwrap();

    let stats = pool.stats().await;
    let json = serde_json::to_string(&stats).unwrap();
    assert!(json.contains("\"active\":1"));
    let parsed: warmpool::PoolStats = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, stats);

    pool.release(s).await;
}
