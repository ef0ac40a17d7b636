//! The revision manager: the monotonic revision counter, long-poll wait,
//! and bounded per-revision deletion history for the root track set.
//!
//! A condition variable owned by the manager decouples the library's
//! change callback from `/update` waiters — the callback locks,
//! increments, stores deletions, notifies, and releases.

use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// How many past revisions' deletion sets are retained. Clients asking
/// for deltas against an older revision fall back to a full listing.
const MAX_HISTORY: usize = 64;

struct State {
    current: u64,
    deletions: BTreeMap<u64, Vec<u64>>,
    running: bool,
}

pub struct RevisionManager {
    state: Mutex<State>,
    condvar: Condvar,
}

impl std::fmt::Debug for RevisionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("RevisionManager")
            .field("current", &state.current)
            .field("history_len", &state.deletions.len())
            .field("running", &state.running)
            .finish()
    }
}

impl Default for RevisionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl RevisionManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                current: 1,
                deletions: BTreeMap::new(),
                running: true,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn current(&self) -> u64 {
        self.state.lock().unwrap().current
    }

    /// Atomically increments the revision, records the deletion set for
    /// the new revision, and wakes all waiters.
    pub fn bump(&self, deleted_ids: Vec<u64>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.current += 1;
        let revision = state.current;
        state.deletions.insert(revision, deleted_ids);
        while state.deletions.len() > MAX_HISTORY {
            let oldest = *state.deletions.keys().next().unwrap();
            state.deletions.remove(&oldest);
        }
        self.condvar.notify_all();
        revision
    }

    /// Blocks until `current() > client_rev` or the server stops;
    /// returns the revision observed at wakeup either way.
    pub fn wait_for_update(&self, client_rev: u64) -> u64 {
        let state = self.state.lock().unwrap();
        let state = self
            .condvar
            .wait_while(state, |s| s.running && s.current <= client_rev)
            .unwrap();
        state.current
    }

    /// Blocks like `wait_for_update`, but gives up after `timeout` and
    /// returns the current revision regardless — used by tests so they
    /// never hang.
    #[cfg(test)]
    pub fn wait_for_update_timeout(&self, client_rev: u64, timeout: Duration) -> u64 {
        let state = self.state.lock().unwrap();
        let (state, _) = self
            .condvar
            .wait_timeout_while(state, timeout, |s| s.running && s.current <= client_rev)
            .unwrap();
        state.current
    }

    /// Union of deletions in `(from_rev, current]`. Revisions older than
    /// the retained history contribute nothing (callers then fall back
    /// to a full listing), not an error.
    pub fn deleted_since(&self, from_rev: u64) -> Vec<u64> {
        let state = self.state.lock().unwrap();
        state
            .deletions
            .range((from_rev + 1)..=state.current)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Marks the server stopped and wakes every waiter; they observe
    /// `!running` and return the current revision (the router then
    /// writes 404).
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        self.condvar.notify_all();
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().unwrap().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wait_for_update_returns_once_revision_advances() {
        let mgr = Arc::new(RevisionManager::new());
        let waiter = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.wait_for_update(1))
        };
        thread::sleep(Duration::from_millis(20));
        let bumped = mgr.bump(vec![]);
        let observed = waiter.join().unwrap();
        assert_eq!(observed, bumped);
        assert!(observed > 1);
    }

    #[test]
    fn wait_for_update_returns_immediately_if_already_past() {
        let mgr = RevisionManager::new();
        mgr.bump(vec![]);
        let observed = mgr.wait_for_update_timeout(1, Duration::from_millis(50));
        assert_eq!(observed, 2);
    }

    #[test]
    fn stop_wakes_waiters_without_a_revision_bump() {
        let mgr = Arc::new(RevisionManager::new());
        let waiter = {
            let mgr = Arc::clone(&mgr);
            thread::spawn(move || mgr.wait_for_update(1))
        };
        thread::sleep(Duration::from_millis(20));
        mgr.stop();
        let observed = waiter.join().unwrap();
        assert_eq!(observed, 1);
        assert!(!mgr.is_running());
    }

    #[test]
    fn deleted_since_is_monotonically_shrinking_as_from_rev_increases() {
        let mgr = RevisionManager::new();
        mgr.bump(vec![1, 2]);
        mgr.bump(vec![3]);
        let since_1 = mgr.deleted_since(1);
        let since_2 = mgr.deleted_since(2);
        for id in &since_2 {
            assert!(since_1.contains(id));
        }
        assert!(since_1.len() >= since_2.len());
    }

    #[test]
    fn pruned_history_yields_empty_deleted_since() {
        let mgr = RevisionManager::new();
        for i in 0..(MAX_HISTORY as u64 + 5) {
            mgr.bump(vec![i]);
        }
        // revision 1 is long pruned; clients should get an empty set, not an error.
        assert!(mgr.deleted_since(1).is_empty());
    }
}
