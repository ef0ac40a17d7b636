//! The session manager: session ids, last-action timestamps, idle
//! expiry, max-user cap.
//!
//! Grounded on `pmoupnp`'s registry modules (`device_registry.rs`,
//! `cache_registry.rs`): a lock-protected map with a manual `Debug` impl
//! and explicit register/lookup/remove methods. Every read here goes
//! through the same lock as writes — there is no lock-free snapshot read
//! anywhere in this module.

use rand::Rng;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use crate::error::ErrorKind;

/// A logged-in DAAP session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: u32,
    pub remote_address: SocketAddr,
    pub username: Option<String>,
    pub last_action_at: Instant,
}

pub struct SessionManager {
    sessions: RwLock<HashMap<u32, Session>>,
    max_users: usize,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let sessions = self.sessions.read().unwrap();
        f.debug_struct("SessionManager")
            .field("session_count", &sessions.len())
            .field("max_users", &self.max_users)
            .finish()
    }
}

impl SessionManager {
    pub fn new(max_users: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_users,
        }
    }

    /// Generates a random positive 31-bit id not already in use, records
    /// `last_action_at=now`. Rejects with `TooManyUsers` if `max_users`
    /// (0 = unlimited) is already reached, without registering a session.
    pub fn login(
        &self,
        remote_address: SocketAddr,
        username: Option<String>,
    ) -> Result<u32, ErrorKind> {
        let mut sessions = self.sessions.write().unwrap();
        if self.max_users != 0 && sessions.len() >= self.max_users {
            return Err(ErrorKind::TooManyUsers);
        }

        let mut rng = rand::rng();
        let session_id = loop {
            // Positive 31-bit id: top bit always clear.
            let candidate = rng.random::<u32>() & 0x7FFF_FFFF;
            if candidate != 0 && !sessions.contains_key(&candidate) {
                break candidate;
            }
        };

        sessions.insert(
            session_id,
            Session {
                session_id,
                remote_address,
                username,
                last_action_at: Instant::now(),
            },
        );
        Ok(session_id)
    }

    /// No-op if `session_id` is absent.
    pub fn touch(&self, session_id: u32) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(&session_id) {
            session.last_action_at = Instant::now();
        }
    }

    pub fn logout(&self, session_id: u32) {
        self.sessions.write().unwrap().remove(&session_id);
    }

    pub fn exists(&self, session_id: u32) -> bool {
        self.sessions.read().unwrap().contains_key(&session_id)
    }

    pub fn count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Removes any session idle for more than `timeout`; returns the ids
    /// removed so the caller can emit logout events for them.
    pub fn expire_idle(&self, timeout: Duration) -> Vec<u32> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().unwrap();
        let expired: Vec<u32> = sessions
            .values()
            .filter(|s| now.duration_since(s.last_action_at) > timeout)
            .map(|s| s.session_id)
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9999)
    }

    #[test]
    fn login_then_logout_leaves_map_at_prior_size() {
        let mgr = SessionManager::new(0);
        let before = mgr.count();
        let id = mgr.login(addr(), None).unwrap();
        assert!(mgr.exists(id));
        mgr.logout(id);
        assert_eq!(mgr.count(), before);
        assert!(!mgr.exists(id));
    }

    #[test]
    fn max_users_cap_rejects_before_registering() {
        let mgr = SessionManager::new(1);
        let first = mgr.login(addr(), None);
        assert!(first.is_ok());
        let second = mgr.login(addr(), None);
        assert_eq!(second.unwrap_err(), ErrorKind::TooManyUsers);
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn touch_on_unknown_session_is_a_no_op() {
        let mgr = SessionManager::new(0);
        mgr.touch(123456);
        assert_eq!(mgr.count(), 0);
    }

    #[test]
    fn expire_idle_removes_sessions_past_timeout() {
        let mgr = SessionManager::new(0);
        let id = mgr.login(addr(), None).unwrap();
        let expired = mgr.expire_idle(Duration::from_secs(0));
        assert_eq!(expired, vec![id]);
        assert!(!mgr.exists(id));
    }

    #[test]
    fn session_ids_are_within_31_bits() {
        let mgr = SessionManager::new(0);
        for _ in 0..20 {
            let id = mgr.login(addr(), None).unwrap();
            assert!(id < (1u32 << 31));
            assert!(id > 0);
        }
    }
}
