//! Locked pool core state.
//!
//! Everything in this module is mutated while holding the pool mutex.
//! The state is an arena of instance entries threaded onto two intrusive
//! doubly-linked lists:
//!
//! - each application group's list, with idle entries gathered at the
//!   head and active ones toward the tail (the head is the best reuse
//!   candidate, the tail the next overflow recipient);
//! - the pool-wide idle list, holding exactly the entries with zero open
//!   sessions, ordered by the time they became idle (head = longest
//!   idle, the global eviction victim).
//!
//! Links are arena keys rather than pointers, so unlinking an entry from
//! either list is O(1) and no cursor is ever invalidated by an insertion.
//!
//! Counter discipline: `count` is the number of entries, `active` the
//! number of entries with open sessions. `active` moves exactly once per
//! acquisition, in the branch that performs the 0 -> 1 session
//! transition, and exactly once per removal or last-session release.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::restart::RestartProbe;
use crate::spawner::AppInstance;

use super::{PoolConfig, PoolStats};

// =============================================================================
// Entry Id
// =============================================================================

/// Process-unique identifier for a pooled instance entry.
///
/// Ids come from a monotonic counter and are never reused, so a stale id
/// held across a purge can never alias a live entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId(u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Intrusive List Plumbing
// =============================================================================

/// Neighbor cursors for one list membership.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Link {
    prev: Option<EntryId>,
    next: Option<EntryId>,
}

/// Pool-wide list of idle entries, threaded through their idle links.
#[derive(Debug, Default)]
struct IdleList {
    head: Option<EntryId>,
    tail: Option<EntryId>,
    len: usize,
}

// =============================================================================
// Instance Entry
// =============================================================================

/// Bookkeeping wrapper around one live instance.
///
/// An entry is never reused across instances: a crashed or retired
/// instance takes its entry with it.
pub(crate) struct InstanceEntry {
    name: String,
    app_root: PathBuf,
    instance: Arc<dyn AppInstance>,
    /// Open sessions on this instance.
    sessions: u32,
    /// Successful releases observed on this instance.
    processed: u64,
    last_used: Instant,
    started_at: DateTime<Utc>,
    group_link: Link,
    idle_link: Link,
    in_idle: bool,
}

// =============================================================================
// Application Group
// =============================================================================

/// Per-application-root aggregate of instance entries.
///
/// Groups are created lazily on the first acquisition for a root and
/// dropped when their last entry leaves.
pub(crate) struct AppGroup {
    head: Option<EntryId>,
    tail: Option<EntryId>,
    pub(crate) size: usize,
    /// Requests an instance may process before retirement; 0 = unbounded.
    /// Seeded from the first acquisition's options and frozen until the
    /// group is destroyed.
    pub(crate) max_requests: u64,
}

impl AppGroup {
    fn new(max_requests: u64) -> Self {
        Self {
            head: None,
            tail: None,
            size: 0,
            max_requests,
        }
    }
}

// =============================================================================
// Pool State
// =============================================================================

/// The complete mutable state of a pool, guarded by the pool mutex.
pub(crate) struct PoolState {
    pub(crate) groups: HashMap<PathBuf, AppGroup>,
    entries: HashMap<EntryId, InstanceEntry>,
    idle: IdleList,
    pub(crate) restart: RestartProbe,

    pub(crate) count: usize,
    pub(crate) active: usize,
    pub(crate) waiting_on_global_queue: usize,

    pub(crate) max: usize,
    pub(crate) max_per_app: usize,
    pub(crate) use_global_queue: bool,
    pub(crate) max_idle_time: Duration,
    pub(crate) clean_interval: Duration,

    pub(crate) spawns_total: u64,
    pub(crate) shutting_down: bool,

    next_id: u64,
}

impl PoolState {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            groups: HashMap::new(),
            entries: HashMap::new(),
            idle: IdleList::default(),
            restart: RestartProbe::new(),
            count: 0,
            active: 0,
            waiting_on_global_queue: 0,
            max: config.max,
            max_per_app: config.max_per_app,
            use_global_queue: config.use_global_queue,
            max_idle_time: config.max_idle_time,
            clean_interval: config.clean_interval,
            spawns_total: 0,
            shutting_down: false,
            next_id: 0,
        }
    }

    pub(crate) fn has_group(&self, app_root: &Path) -> bool {
        self.groups.contains_key(app_root)
    }

    pub(crate) fn group_size(&self, app_root: &Path) -> usize {
        self.groups.get(app_root).map(|g| g.size).unwrap_or(0)
    }

    fn allocate_id(&mut self) -> EntryId {
        self.next_id += 1;
        EntryId(self.next_id)
    }

    // =========================================================================
    // Selection
    // =========================================================================

    /// Reuses the group's head entry if it is idle.
    ///
    /// The entry moves to the group tail (it is now the most recently
    /// activated), leaves the idle list, and counts as active again.
    pub(crate) fn reuse_idle_head(
        &mut self,
        app_root: &Path,
    ) -> Option<(EntryId, String, Arc<dyn AppInstance>)> {
        let head = self.groups.get(app_root)?.head?;
        if self.entries.get(&head)?.sessions != 0 {
            return None;
        }
        self.idle_unlink(head);
        self.group_move_to_back(app_root, head);
        self.active += 1;
        let entry = self.entries.get_mut(&head)?;
        entry.sessions = 1;
        entry.last_used = Instant::now();
        debug!(
            app = %app_root.display(),
            instance = %entry.name,
            "reusing idle instance"
        );
        Some((head, entry.name.clone(), Arc::clone(&entry.instance)))
    }

    /// Shares the group's least-loaded entry when the pool is full.
    ///
    /// Ties break toward the earliest list position. The chosen entry
    /// moves to the group tail so consecutive overflows rotate through
    /// the group.
    pub(crate) fn checkout_least_loaded(
        &mut self,
        app_root: &Path,
    ) -> Option<(EntryId, String, Arc<dyn AppInstance>)> {
        let mut cur = self.groups.get(app_root)?.head;
        let mut best: Option<(EntryId, u32)> = None;
        while let Some(id) = cur {
            let entry = self.entries.get(&id)?;
            match best {
                Some((_, sessions)) if entry.sessions >= sessions => {}
                _ => best = Some((id, entry.sessions)),
            }
            cur = entry.group_link.next;
        }
        let (id, _) = best?;
        // The group ordering keeps idle entries at the head, so a full
        // pool normally has none here; handle the transition anyway so
        // `active` can never drift.
        if self.entries.get(&id)?.in_idle {
            self.idle_unlink(id);
            self.active += 1;
        }
        self.group_move_to_back(app_root, id);
        let entry = self.entries.get_mut(&id)?;
        entry.sessions += 1;
        entry.last_used = Instant::now();
        debug!(
            app = %app_root.display(),
            instance = %entry.name,
            sessions = entry.sessions,
            "pool full; sharing least-loaded instance"
        );
        Some((id, entry.name.clone(), Arc::clone(&entry.instance)))
    }

    // =========================================================================
    // Insertion and Removal
    // =========================================================================

    /// Commits a freshly spawned instance, creating its group on demand.
    ///
    /// The entry starts with one open session (the acquisition that
    /// spawned it).
    pub(crate) fn insert_spawned(
        &mut self,
        app_root: &Path,
        instance: Arc<dyn AppInstance>,
        max_requests: u64,
    ) -> (EntryId, String) {
        let id = self.allocate_id();
        let name = format!("{}-{}", app_basename(app_root), id);
        self.groups
            .entry(app_root.to_path_buf())
            .or_insert_with(|| AppGroup::new(max_requests));
        self.entries.insert(
            id,
            InstanceEntry {
                name: name.clone(),
                app_root: app_root.to_path_buf(),
                instance,
                sessions: 1,
                processed: 0,
                last_used: Instant::now(),
                started_at: Utc::now(),
                group_link: Link::default(),
                idle_link: Link::default(),
                in_idle: false,
            },
        );
        self.group_push_back(app_root, id);
        self.count += 1;
        self.active += 1;
        info!(
            app = %app_root.display(),
            instance = %name,
            count = self.count,
            active = self.active,
            "instance joined the pool"
        );
        (id, name)
    }

    /// Removes an entry from both lists and the arena.
    ///
    /// Drops the owning group (and its restart record) when this was its
    /// last entry. Returns the instance so the caller can dispose it
    /// outside the lock.
    pub(crate) fn remove_entry(&mut self, id: EntryId) -> Option<Arc<dyn AppInstance>> {
        let (app_root, was_idle, name, started_at) = {
            let entry = self.entries.get(&id)?;
            (
                entry.app_root.clone(),
                entry.in_idle,
                entry.name.clone(),
                entry.started_at,
            )
        };
        if was_idle {
            self.idle_unlink(id);
        } else {
            self.active = self.active.saturating_sub(1);
        }
        self.group_unlink(&app_root, id);
        self.count = self.count.saturating_sub(1);
        if self.groups.get(&app_root).map(|g| g.size) == Some(0) {
            self.groups.remove(&app_root);
            self.restart.forget(&app_root);
            debug!(
                app = %app_root.display(),
                "last instance left; dropping application group"
            );
        }
        debug!(
            app = %app_root.display(),
            instance = %name,
            uptime_secs = (Utc::now() - started_at).num_seconds(),
            count = self.count,
            "instance left the pool"
        );
        self.entries.remove(&id).map(|entry| entry.instance)
    }

    /// Discards an entry whose instance crashed while opening a session.
    ///
    /// The acquisition's session increment is rolled back first so the
    /// removal accounting stays uniform.
    pub(crate) fn discard_failed(&mut self, id: EntryId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.sessions = entry.sessions.saturating_sub(1);
        }
        let _ = self.remove_entry(id);
    }

    /// Evicts the longest-idle entry pool-wide to make room for a new
    /// application. Returns its instance for disposal, or `None` when
    /// nothing is idle.
    pub(crate) fn evict_longest_idle(&mut self) -> Option<Arc<dyn AppInstance>> {
        let id = self.idle.head?;
        if let Some(entry) = self.entries.get(&id) {
            info!(
                app = %entry.app_root.display(),
                instance = %entry.name,
                "pool full; evicting longest-idle instance"
            );
        }
        self.remove_entry(id)
    }

    // =========================================================================
    // Release
    // =========================================================================

    /// Ends one session on an entry.
    ///
    /// Returns the instance when the entry was retired on its request
    /// cap, so the caller can dispose it outside the lock. A stale id
    /// (entry purged while the session was in flight) is dropped
    /// silently.
    pub(crate) fn release_entry(&mut self, id: EntryId) -> Option<Arc<dyn AppInstance>> {
        let (app_root, processed) = {
            let entry = self.entries.get_mut(&id)?;
            entry.processed += 1;
            (entry.app_root.clone(), entry.processed)
        };
        let max_requests = self
            .groups
            .get(&app_root)
            .map(|g| g.max_requests)
            .unwrap_or(0);
        if max_requests > 0 && processed >= max_requests {
            if let Some(entry) = self.entries.get(&id) {
                info!(
                    app = %app_root.display(),
                    instance = %entry.name,
                    processed,
                    "request cap reached; retiring instance"
                );
            }
            return self.remove_entry(id);
        }
        let became_idle = {
            let entry = self.entries.get_mut(&id)?;
            entry.sessions = entry.sessions.saturating_sub(1);
            entry.last_used = Instant::now();
            entry.sessions == 0 && !entry.in_idle
        };
        if became_idle {
            self.group_move_to_front(&app_root, id);
            self.idle_push_back(id);
            self.active = self.active.saturating_sub(1);
        }
        None
    }

    // =========================================================================
    // Purge, Sweep, Drain
    // =========================================================================

    /// Removes every entry of an application group.
    ///
    /// Used by the restart trigger and by shutdown. Returns the
    /// instances for disposal outside the lock.
    pub(crate) fn purge_group(&mut self, app_root: &Path) -> Vec<Arc<dyn AppInstance>> {
        let mut ids = Vec::new();
        let mut cur = self.groups.get(app_root).and_then(|g| g.head);
        while let Some(id) = cur {
            cur = self.entries.get(&id).and_then(|e| e.group_link.next);
            ids.push(id);
        }
        let mut victims = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(instance) = self.remove_entry(id) {
                victims.push(instance);
            }
        }
        self.restart.forget(app_root);
        victims
    }

    /// Retires every idle entry older than `max_idle_time`.
    ///
    /// The idle list is ordered by the time entries became idle, so the
    /// scan stops at the first entry that is still fresh.
    pub(crate) fn sweep_expired(&mut self) -> Vec<Arc<dyn AppInstance>> {
        if self.max_idle_time.is_zero() {
            return Vec::new();
        }
        let mut victims = Vec::new();
        while let Some(id) = self.idle.head {
            let expired = self
                .entries
                .get(&id)
                .map(|e| e.last_used.elapsed() > self.max_idle_time)
                .unwrap_or(false);
            if !expired {
                break;
            }
            match self.remove_entry(id) {
                Some(instance) => victims.push(instance),
                None => break,
            }
        }
        if !victims.is_empty() {
            info!(
                retired = victims.len(),
                count = self.count,
                "idle sweep retired instances"
            );
        }
        victims
    }

    /// Empties the pool for shutdown. Returns every instance for
    /// disposal outside the lock.
    pub(crate) fn drain_all(&mut self) -> Vec<Arc<dyn AppInstance>> {
        let roots: Vec<PathBuf> = self.groups.keys().cloned().collect();
        let mut victims = Vec::new();
        for root in roots {
            victims.extend(self.purge_group(&root));
        }
        victims
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            count: self.count,
            active: self.active,
            idle: self.idle.len,
            waiting_on_global_queue: self.waiting_on_global_queue,
            max: self.max,
            max_per_app: self.max_per_app,
            groups: self.groups.len(),
            spawns_total: self.spawns_total,
        }
    }

    // =========================================================================
    // Group List Plumbing
    // =========================================================================

    fn group_push_back(&mut self, app_root: &Path, id: EntryId) {
        let Some(old_tail) = self.groups.get(app_root).map(|g| g.tail) else {
            return;
        };
        if let Some(tail_id) = old_tail {
            if let Some(tail) = self.entries.get_mut(&tail_id) {
                tail.group_link.next = Some(id);
            }
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.group_link = Link {
                prev: old_tail,
                next: None,
            };
        }
        if let Some(group) = self.groups.get_mut(app_root) {
            group.tail = Some(id);
            if group.head.is_none() {
                group.head = Some(id);
            }
            group.size += 1;
        }
    }

    fn group_push_front(&mut self, app_root: &Path, id: EntryId) {
        let Some(old_head) = self.groups.get(app_root).map(|g| g.head) else {
            return;
        };
        if let Some(head_id) = old_head {
            if let Some(head) = self.entries.get_mut(&head_id) {
                head.group_link.prev = Some(id);
            }
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.group_link = Link {
                prev: None,
                next: old_head,
            };
        }
        if let Some(group) = self.groups.get_mut(app_root) {
            group.head = Some(id);
            if group.tail.is_none() {
                group.tail = Some(id);
            }
            group.size += 1;
        }
    }

    fn group_unlink(&mut self, app_root: &Path, id: EntryId) {
        let Some(link) = self.entries.get(&id).map(|e| e.group_link) else {
            return;
        };
        if let Some(prev_id) = link.prev {
            if let Some(prev) = self.entries.get_mut(&prev_id) {
                prev.group_link.next = link.next;
            }
        }
        if let Some(next_id) = link.next {
            if let Some(next) = self.entries.get_mut(&next_id) {
                next.group_link.prev = link.prev;
            }
        }
        if let Some(group) = self.groups.get_mut(app_root) {
            if group.head == Some(id) {
                group.head = link.next;
            }
            if group.tail == Some(id) {
                group.tail = link.prev;
            }
            group.size = group.size.saturating_sub(1);
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.group_link = Link::default();
        }
    }

    fn group_move_to_back(&mut self, app_root: &Path, id: EntryId) {
        if self.groups.get(app_root).map(|g| g.tail) == Some(Some(id)) {
            return;
        }
        self.group_unlink(app_root, id);
        self.group_push_back(app_root, id);
    }

    fn group_move_to_front(&mut self, app_root: &Path, id: EntryId) {
        if self.groups.get(app_root).map(|g| g.head) == Some(Some(id)) {
            return;
        }
        self.group_unlink(app_root, id);
        self.group_push_front(app_root, id);
    }

    // =========================================================================
    // Idle List Plumbing
    // =========================================================================

    fn idle_push_back(&mut self, id: EntryId) {
        let already_idle = self.entries.get(&id).map(|e| e.in_idle).unwrap_or(true);
        if already_idle {
            return;
        }
        let old_tail = self.idle.tail;
        if let Some(tail_id) = old_tail {
            if let Some(tail) = self.entries.get_mut(&tail_id) {
                tail.idle_link.next = Some(id);
            }
        }
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.idle_link = Link {
                prev: old_tail,
                next: None,
            };
            entry.in_idle = true;
        }
        self.idle.tail = Some(id);
        if self.idle.head.is_none() {
            self.idle.head = Some(id);
        }
        self.idle.len += 1;
    }

    fn idle_unlink(&mut self, id: EntryId) {
        let Some((link, in_idle)) = self.entries.get(&id).map(|e| (e.idle_link, e.in_idle))
        else {
            return;
        };
        if !in_idle {
            return;
        }
        if let Some(prev_id) = link.prev {
            if let Some(prev) = self.entries.get_mut(&prev_id) {
                prev.idle_link.next = link.next;
            }
        }
        if let Some(next_id) = link.next {
            if let Some(next) = self.entries.get_mut(&next_id) {
                next.idle_link.prev = link.prev;
            }
        }
        if self.idle.head == Some(id) {
            self.idle.head = link.next;
        }
        if self.idle.tail == Some(id) {
            self.idle.tail = link.prev;
        }
        self.idle.len = self.idle.len.saturating_sub(1);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.idle_link = Link::default();
            entry.in_idle = false;
        }
    }

    // =========================================================================
    // Test Support
    // =========================================================================

    /// Walks every structure and re-derives the cross-entity invariants.
    /// Returns a description of the first violation found.
    #[cfg(test)]
    pub(crate) fn consistency_error(&self) -> Option<String> {
        if self.count != self.entries.len() {
            return Some(format!(
                "count {} != arena size {}",
                self.count,
                self.entries.len()
            ));
        }
        let group_sum: usize = self.groups.values().map(|g| g.size).sum();
        if group_sum != self.count {
            return Some(format!("sum of group sizes {group_sum} != count {}", self.count));
        }
        if self.active > self.count {
            return Some(format!("active {} > count {}", self.active, self.count));
        }
        let active_entries = self.entries.values().filter(|e| e.sessions > 0).count();
        if active_entries != self.active {
            return Some(format!(
                "active {} != entries with sessions {active_entries}",
                self.active
            ));
        }
        if self.idle.len != self.count - self.active {
            return Some(format!(
                "idle len {} != count {} - active {}",
                self.idle.len, self.count, self.active
            ));
        }
        let idle_flags = self.entries.values().filter(|e| e.in_idle).count();
        if idle_flags != self.idle.len {
            return Some(format!(
                "idle flags {idle_flags} != idle len {}",
                self.idle.len
            ));
        }

        for (root, group) in &self.groups {
            if group.size == 0 {
                return Some(format!("empty group retained for {}", root.display()));
            }
            let mut seen = 0usize;
            let mut prev: Option<EntryId> = None;
            let mut cur = group.head;
            let mut seen_active = false;
            while let Some(id) = cur {
                let Some(entry) = self.entries.get(&id) else {
                    return Some(format!("dangling id {id} in group {}", root.display()));
                };
                if entry.app_root != *root {
                    return Some(format!("entry {id} listed under the wrong group"));
                }
                if entry.group_link.prev != prev {
                    return Some(format!("broken back-link at entry {id}"));
                }
                if entry.in_idle != (entry.sessions == 0) {
                    return Some(format!(
                        "entry {id} idle membership disagrees with its session count"
                    ));
                }
                if entry.sessions > 0 {
                    seen_active = true;
                } else if seen_active {
                    return Some(format!(
                        "idle entry {id} follows an active one in group {}",
                        root.display()
                    ));
                }
                prev = cur;
                cur = entry.group_link.next;
                seen += 1;
                if seen > self.entries.len() {
                    return Some(format!("cycle in group list for {}", root.display()));
                }
            }
            if seen != group.size {
                return Some(format!(
                    "group {} walks {seen} entries but records size {}",
                    root.display(),
                    group.size
                ));
            }
            if group.tail != prev {
                return Some(format!("group {} tail cursor is stale", root.display()));
            }
        }

        let mut seen = 0usize;
        let mut prev: Option<EntryId> = None;
        let mut cur = self.idle.head;
        while let Some(id) = cur {
            let Some(entry) = self.entries.get(&id) else {
                return Some(format!("dangling id {id} in idle list"));
            };
            if !entry.in_idle || entry.sessions != 0 {
                return Some(format!("non-idle entry {id} on the idle list"));
            }
            if entry.idle_link.prev != prev {
                return Some(format!("broken idle back-link at entry {id}"));
            }
            prev = cur;
            cur = entry.idle_link.next;
            seen += 1;
            if seen > self.entries.len() {
                return Some("cycle in idle list".to_string());
            }
        }
        if seen != self.idle.len {
            return Some(format!(
                "idle list walks {seen} entries but records len {}",
                self.idle.len
            ));
        }
        if self.idle.tail != prev {
            return Some("idle tail cursor is stale".to_string());
        }

        for root in self.restart.recorded_roots() {
            if !self.groups.contains_key(root) {
                return Some(format!(
                    "restart record for {} outlived its group",
                    root.display()
                ));
            }
        }
        None
    }

    /// Group list order, head to tail, by instance name.
    #[cfg(test)]
    pub(crate) fn group_order(&self, app_root: &Path) -> Vec<String> {
        let mut order = Vec::new();
        let mut cur = self.groups.get(app_root).and_then(|g| g.head);
        while let Some(id) = cur {
            let Some(entry) = self.entries.get(&id) else {
                break;
            };
            order.push(entry.name.clone());
            cur = entry.group_link.next;
        }
        order
    }
}

fn app_basename(app_root: &Path) -> &str {
    app_root
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("app")
}
