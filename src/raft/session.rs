//! Session bookkeeping for the state-machine runtime.
//!
//! A session tracks a client's lifecycle across many commits. `register`
//! fires once per session on first observation; `ACTIVE -> EXPIRED` and
//! `ACTIVE -> CLOSED` are both terminal, driven externally by the leader's
//! keep-alive protocol rather than by anything in this module.

use std::collections::HashMap;

pub type SessionId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Expired,
    Closed,
}

#[derive(Default)]
pub struct SessionTable {
    sessions: HashMap<SessionId, SessionState>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `id` was seen. Returns `true` the first time, signaling
    /// the caller should fire the state machine's `register` hook.
    pub fn observe(&mut self, id: SessionId) -> bool {
        if self.sessions.contains_key(&id) {
            false
        } else {
            self.sessions.insert(id, SessionState::Active);
            true
        }
    }

    pub fn is_live(&self, id: SessionId) -> bool {
        matches!(self.sessions.get(&id), Some(SessionState::Active))
    }

    pub fn state(&self, id: SessionId) -> Option<SessionState> {
        self.sessions.get(&id).copied()
    }

    /// Marks `id` expired. A no-op if the session is already terminal
    /// (expired/closed are both terminal).
    pub fn expire(&mut self, id: SessionId) -> bool {
        self.transition(id, SessionState::Expired)
    }

    pub fn close(&mut self, id: SessionId) -> bool {
        self.transition(id, SessionState::Closed)
    }

    fn transition(&mut self, id: SessionId, to: SessionState) -> bool {
        match self.sessions.get(&id) {
            Some(SessionState::Active) => {
                self.sessions.insert(id, to);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_fires_once() {
        let mut sessions = SessionTable::new();
        assert!(sessions.observe(1));
        assert!(!sessions.observe(1));
        assert_eq!(sessions.state(1), Some(SessionState::Active));
    }

    #[test]
    fn expire_and_close_are_terminal() {
        let mut sessions = SessionTable::new();
        sessions.observe(1);
        assert!(sessions.expire(1));
        assert!(!sessions.is_live(1));
        assert!(!sessions.close(1)); // already terminal
        assert_eq!(sessions.state(1), Some(SessionState::Expired));
    }

    #[test]
    fn unknown_session_is_not_live() {
        let sessions = SessionTable::new();
        assert!(!sessions.is_live(42));
        assert_eq!(sessions.state(42), None);
    }
}
