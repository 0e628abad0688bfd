//! Session store port and its in-memory adapter
//!
//! Call-control logic only talks to [`SessionStore`], so tests can swap in a
//! fake and a clustered deployment can provide a shared implementation.

use super::session::CallSession;
use crate::domain::shared::{DomainError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Closure run against one session under the store's lock
pub type SessionMutation<'a> = dyn FnMut(&mut CallSession) -> Result<()> + 'a;

/// Closure run against two sessions under the store's lock
pub type PairMutation<'a> = dyn FnMut(&mut CallSession, &mut CallSession) -> Result<()> + 'a;

/// Storage for call sessions keyed by call id.
///
/// `update` and `update_pair` are the serialization points: the closure sees
/// a working copy and the store commits it only when the closure returns `Ok`.
pub trait SessionStore: Send + Sync {
    /// Insert a new session. Fails if a non-terminal session with the same id exists.
    fn insert(&self, session: CallSession) -> Result<()>;

    fn get(&self, call_id: &str) -> Option<CallSession>;

    fn list(&self) -> Vec<CallSession>;

    fn update(&self, call_id: &str, mutation: &mut SessionMutation<'_>) -> Result<CallSession>;

    fn update_pair(
        &self,
        first: &str,
        second: &str,
        mutation: &mut PairMutation<'_>,
    ) -> Result<(CallSession, CallSession)>;

    fn remove(&self, call_id: &str) -> Option<CallSession>;

    /// Drop every session for which `keep` returns false; returns the number removed
    fn retain(&self, keep: &mut dyn FnMut(&CallSession) -> bool) -> usize;
}

/// Single-node store guarded by one lock
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<String, CallSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn insert(&self, session: CallSession) -> Result<()> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&session.call_id) {
            if !existing.is_terminal() {
                return Err(DomainError::AlreadyExists(format!(
                    "call {}",
                    session.call_id
                )));
            }
        }
        sessions.insert(session.call_id.clone(), session);
        Ok(())
    }

    fn get(&self, call_id: &str) -> Option<CallSession> {
        self.sessions.read().get(call_id).cloned()
    }

    fn list(&self) -> Vec<CallSession> {
        self.sessions.read().values().cloned().collect()
    }

    fn update(&self, call_id: &str, mutation: &mut SessionMutation<'_>) -> Result<CallSession> {
        let mut sessions = self.sessions.write();
        let current = sessions
            .get_mut(call_id)
            .ok_or_else(|| DomainError::NotFound(format!("call {}", call_id)))?;

        let mut working = current.clone();
        mutation(&mut working)?;
        *current = working.clone();
        Ok(working)
    }

    fn update_pair(
        &self,
        first: &str,
        second: &str,
        mutation: &mut PairMutation<'_>,
    ) -> Result<(CallSession, CallSession)> {
        if first == second {
            return Err(DomainError::ValidationError(format!(
                "call {} cannot be paired with itself",
                first
            )));
        }

        let mut sessions = self.sessions.write();
        let mut a = sessions
            .get(first)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("call {}", first)))?;
        let mut b = sessions
            .get(second)
            .cloned()
            .ok_or_else(|| DomainError::NotFound(format!("call {}", second)))?;

        mutation(&mut a, &mut b)?;
        sessions.insert(a.call_id.clone(), a.clone());
        sessions.insert(b.call_id.clone(), b.clone());
        Ok((a, b))
    }

    fn remove(&self, call_id: &str) -> Option<CallSession> {
        self.sessions.write().remove(call_id)
    }

    fn retain(&self, keep: &mut dyn FnMut(&CallSession) -> bool) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, session| keep(session));
        before - sessions.len()
    }
}
