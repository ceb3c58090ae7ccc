//! Websocket connection statistics
//!
//! Process-wide counters of currently active and total closed websocket
//! connections. Closed connection ids are kept in a bounded FIFO cache so
//! that a duplicate close report for a recently seen id does not inflate the
//! totals. `reset` exists to make tests deterministic.

use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use std::sync::{LazyLock, Mutex, MutexGuard};

/// Default bound for the closed-connection id cache
pub const DEFAULT_CLOSED_CACHE_CAP: usize = 100;

/// Counters for websocket connections
#[derive(Debug)]
pub struct ConnectionStats {
    active: HashSet<String>,
    closed_cache: VecDeque<String>,
    closed_cached_ids: HashSet<String>,
    closed_cache_cap: usize,
    total_closed: u64,
}

/// Snapshot returned by [`ConnectionStats::get_stats`]
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatsSnapshot {
    pub total_active: usize,
    pub total_closed: u64,
    pub active_ids: Vec<String>,
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new(DEFAULT_CLOSED_CACHE_CAP)
    }
}

impl ConnectionStats {
    /// Create counters with the given closed-cache bound
    pub fn new(closed_cache_cap: usize) -> Self {
        ConnectionStats {
            active: HashSet::new(),
            closed_cache: VecDeque::new(),
            closed_cached_ids: HashSet::new(),
            closed_cache_cap,
            total_closed: 0,
        }
    }

    /// Record a newly opened connection
    pub fn add_active(&mut self, id: impl Into<String>) {
        self.active.insert(id.into());
    }

    /// Record a closed connection: removes it from the active set; a close
    /// for an id still present in the cache is ignored
    pub fn add_closed(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.active.remove(&id);

        if self.closed_cached_ids.contains(&id) {
            return;
        }

        self.total_closed += 1;
        if self.closed_cache_cap == 0 {
            return;
        }
        while self.closed_cache.len() >= self.closed_cache_cap {
            if let Some(evicted) = self.closed_cache.pop_front() {
                self.closed_cached_ids.remove(&evicted);
            }
        }
        self.closed_cached_ids.insert(id.clone());
        self.closed_cache.push_back(id);
    }

    /// Change the closed-cache bound, keeping the newest entries
    pub fn set_closed_cache_cap(&mut self, cap: usize) {
        self.closed_cache_cap = cap;
        while self.closed_cache.len() > cap {
            if let Some(evicted) = self.closed_cache.pop_front() {
                self.closed_cached_ids.remove(&evicted);
            }
        }
    }

    /// Number of ids currently held in the closed cache
    pub fn closed_cache_len(&self) -> usize {
        self.closed_cache.len()
    }

    /// The cached closed ids, oldest first
    pub fn closed_ids(&self) -> Vec<String> {
        self.closed_cache.iter().cloned().collect()
    }

    /// Snapshot of the current counters
    pub fn get_stats(&self) -> ConnectionStatsSnapshot {
        let mut active_ids: Vec<String> = self.active.iter().cloned().collect();
        active_ids.sort();
        ConnectionStatsSnapshot {
            total_active: self.active.len(),
            total_closed: self.total_closed,
            active_ids,
        }
    }

    /// Zero every counter and drop all cached ids
    pub fn reset(&mut self) {
        self.active.clear();
        self.closed_cache.clear();
        self.closed_cached_ids.clear();
        self.total_closed = 0;
    }
}

static GLOBAL_STATS: LazyLock<Mutex<ConnectionStats>> =
    LazyLock::new(|| Mutex::new(ConnectionStats::default()));

fn global_stats() -> MutexGuard<'static, ConnectionStats> {
    // a poisoned lock only means a panic elsewhere; the counters stay usable
    GLOBAL_STATS
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Record a newly opened connection in the process-wide counters
pub fn add_active_connection(id: impl Into<String>) {
    global_stats().add_active(id);
}

/// Record a closed connection in the process-wide counters
pub fn add_closed_connection(id: impl Into<String>) {
    global_stats().add_closed(id);
}

/// Change the process-wide closed-cache bound
pub fn set_closed_connection_cache_cap(cap: usize) {
    global_stats().set_closed_cache_cap(cap);
}

/// Snapshot of the process-wide counters
pub fn connection_stats() -> ConnectionStatsSnapshot {
    global_stats().get_stats()
}

/// Reset the process-wide counters
pub fn reset_connection_stats() {
    global_stats().reset();
}
