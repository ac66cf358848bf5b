//! `connection-handle -> Session` map. Linear scan is acceptable: sessions
//! per process are expected to number in the tens, not thousands.

use std::collections::HashMap;

use crate::session::{Session, SessionHandle};

#[derive(Default)]
pub struct SessionManager {
    sessions: HashMap<u64, Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            sessions: HashMap::new(),
        }
    }

    pub fn insert(&mut self, session: Session) {
        self.sessions.insert(session.handle().0, session);
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(&handle.0)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions.get_mut(&handle.0)
    }

    /// Disposes and removes the session owning `handle`, if any.
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session> {
        let mut session = self.sessions.remove(&handle.0)?;
        session.dispose();
        Some(session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
