//! Registry of connected WebSocket sessions, keyed by user id. A user may
//! hold any number of concurrent sessions; pushes fan out to all of them
//! through unbounded channels, so one stalled client never blocks another.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};

pub type SharedSessions = Arc<RwLock<SessionMap>>;

pub struct Session {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

#[derive(Default)]
pub struct SessionMap {
    sessions: HashMap<String, Vec<Session>>,
    next_id: u64,
}

impl SessionMap {
    pub fn shared() -> SharedSessions {
        Arc::new(RwLock::new(Self::default()))
    }

    /// Register a session for `user_id`. The returned id is the handle for
    /// `unregister` when the socket closes.
    pub fn register(&mut self, user_id: &str, tx: mpsc::UnboundedSender<String>) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.sessions
            .entry(user_id.to_string())
            .or_default()
            .push(Session { id, tx });
        id
    }

    pub fn unregister(&mut self, user_id: &str, session_id: u64) {
        if let Some(list) = self.sessions.get_mut(user_id) {
            list.retain(|s| s.id != session_id);
            if list.is_empty() {
                self.sessions.remove(user_id);
            }
        }
    }

    /// Push a payload to every session of `user_id`. Dead channels are
    /// pruned on the way. Returns the number of sessions reached.
    pub fn push(&mut self, user_id: &str, payload: &str) -> usize {
        let Some(list) = self.sessions.get_mut(user_id) else {
            return 0;
        };

        let mut delivered = 0;
        list.retain(|s| {
            if s.tx.send(payload.to_string()).is_ok() {
                delivered += 1;
                true
            } else {
                false
            }
        });
        if list.is_empty() {
            self.sessions.remove(user_id);
        }
        delivered
    }

    /// Total connected sessions across all users.
    pub fn connected(&self) -> usize {
        self.sessions.values().map(Vec::len).sum()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_reaches_all_sessions_of_one_user() {
        let mut map = SessionMap::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        map.register("user-1", tx1);
        map.register("user-1", tx2);

        assert_eq!(map.push("user-1", "hello"), 2);
        assert_eq!(rx1.try_recv().unwrap(), "hello");
        assert_eq!(rx2.try_recv().unwrap(), "hello");
    }

    #[test]
    fn push_does_not_cross_users() {
        let mut map = SessionMap::default();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        map.register("user-1", tx1);
        map.register("user-2", tx2);

        assert_eq!(map.push("user-1", "a"), 1);
        assert_eq!(rx1.try_recv().unwrap(), "a");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn push_to_unknown_user_is_zero() {
        let mut map = SessionMap::default();
        assert_eq!(map.push("nobody", "x"), 0);
    }

    #[test]
    fn dead_sessions_are_pruned() {
        let mut map = SessionMap::default();
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        map.register("user-1", tx);
        drop(rx); // client gone

        assert_eq!(map.push("user-1", "x"), 0);
        assert_eq!(map.connected(), 0);
    }

    #[test]
    fn unregister_removes_only_that_session() {
        let mut map = SessionMap::default();
        let (tx1, _rx1) = mpsc::unbounded_channel();
        let (tx2, _rx2) = mpsc::unbounded_channel();
        let id1 = map.register("user-1", tx1);
        map.register("user-1", tx2);
        assert_eq!(map.connected(), 2);

        map.unregister("user-1", id1);
        assert_eq!(map.connected(), 1);
    }
}
