//! Session registry - authoritative table of call sessions
//!
//! All state changes go through the store's `update`, so each session is
//! mutated under one lock and two concurrent operations on the same call id
//! can never both succeed into conflicting states.

use super::session::CallSession;
use super::store::{InMemorySessionStore, SessionStore};
use super::value_object::{CallState, PendingOperation};
use crate::domain::shared::{DomainError, Result};
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};

/// Release of everything attached to a call once it reaches Terminated.
///
/// Runs exactly once per call, after the store lock is released, whichever
/// path ended the call (hangup, blind transfer, attended merge).
pub trait CallTeardown: Send + Sync {
    fn call_ended(&self, session: &CallSession);
}

#[derive(Clone)]
pub struct SessionRegistry {
    store: Arc<dyn SessionStore>,
    teardown: Arc<RwLock<Vec<Arc<dyn CallTeardown>>>>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self {
            store,
            teardown: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn add_teardown(&self, hook: Arc<dyn CallTeardown>) {
        self.teardown.write().push(hook);
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemorySessionStore::new()))
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Register a new session in its initial state
    pub fn create_session(&self, session: CallSession) -> Result<CallSession> {
        if session.is_terminal() {
            return Err(DomainError::ValidationError(format!(
                "call {} cannot be created terminated",
                session.call_id
            )));
        }

        info!(
            "Call {} created ({} {} -> {})",
            session.call_id,
            session.direction.as_str(),
            session.from_number,
            session.to_number
        );
        self.store.insert(session.clone())?;
        Ok(session)
    }

    pub fn get(&self, call_id: &str) -> Option<CallSession> {
        self.store.get(call_id)
    }

    pub fn get_required(&self, call_id: &str) -> Result<CallSession> {
        self.store
            .get(call_id)
            .ok_or_else(|| DomainError::NotFound(format!("call {}", call_id)))
    }

    pub fn list(&self) -> Vec<CallSession> {
        let mut sessions = self.store.list();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    pub fn active_count(&self) -> usize {
        self.store.list().iter().filter(|s| !s.is_terminal()).count()
    }

    pub fn duration(&self, call_id: &str) -> Option<Duration> {
        self.store.get(call_id).map(|s| s.duration())
    }

    /// Apply a transition from the call state table
    pub fn set_state(&self, call_id: &str, next: CallState) -> Result<CallSession> {
        let updated = self.update_tracked(call_id, &mut |s| s.set_state(next))?;
        debug!("Call {} -> {}", call_id, next);
        Ok(updated)
    }

    /// Mark the call answered
    pub fn answer(&self, call_id: &str) -> Result<CallSession> {
        self.set_state(call_id, CallState::Active)
    }

    /// Terminate from any non-terminal state, dropping any in-flight claim
    pub fn hangup(&self, call_id: &str, reason: &str) -> Result<CallSession> {
        let updated = self.update_tracked(call_id, &mut |s| {
            s.set_state(CallState::Terminated)?;
            s.end_reason = Some(reason.to_string());
            Ok(())
        })?;
        info!("Call {} terminated: {}", call_id, reason);
        Ok(updated)
    }

    /// Atomically check the precondition and take the session's claim.
    ///
    /// A session already claimed by another operation yields
    /// `InvalidStateTransition`; a settled state outside `allowed` yields the
    /// error built by `rejected`.
    pub fn claim(
        &self,
        call_id: &str,
        op: PendingOperation,
        allowed: &[CallState],
        rejected: impl Fn(&CallSession) -> DomainError,
    ) -> Result<CallSession> {
        self.store.update(call_id, &mut |s| {
            if s.pending().is_none() && !allowed.contains(&s.state()) {
                return Err(rejected(s));
            }
            s.claim(op)
        })
    }

    /// Commit an operation's result if the claim survived the I/O window
    pub fn commit(
        &self,
        call_id: &str,
        op: PendingOperation,
        mut apply: impl FnMut(&mut CallSession) -> Result<()>,
    ) -> Result<CallSession> {
        self.update_tracked(call_id, &mut |s| {
            s.ensure_claimed(op)?;
            apply(s)?;
            s.release(op);
            Ok(())
        })
    }

    /// Mutate a claimed session while keeping the claim for a later commit
    pub fn update_claimed(
        &self,
        call_id: &str,
        op: PendingOperation,
        mut apply: impl FnMut(&mut CallSession) -> Result<()>,
    ) -> Result<CallSession> {
        self.update_tracked(call_id, &mut |s| {
            s.ensure_claimed(op)?;
            apply(s)
        })
    }

    /// Give the claim back without touching anything else
    pub fn release(&self, call_id: &str, op: PendingOperation) {
        let _ = self.store.update(call_id, &mut |s| {
            s.release(op);
            Ok(())
        });
    }

    /// Run a closure against two distinct sessions as one atomic step
    pub fn update_pair(
        &self,
        first: &str,
        second: &str,
        mut apply: impl FnMut(&mut CallSession, &mut CallSession) -> Result<()>,
    ) -> Result<(CallSession, CallSession)> {
        let mut was_live = (false, false);
        let (a, b) = self.store.update_pair(first, second, &mut |x, y| {
            was_live = (!x.is_terminal(), !y.is_terminal());
            apply(x, y)
        })?;
        self.ended_if(was_live.0, &a);
        self.ended_if(was_live.1, &b);
        Ok((a, b))
    }

    /// `store.update` that runs the teardown hooks when this update ended the call
    fn update_tracked(
        &self,
        call_id: &str,
        apply: &mut dyn FnMut(&mut CallSession) -> Result<()>,
    ) -> Result<CallSession> {
        let mut was_live = false;
        let updated = self.store.update(call_id, &mut |s| {
            was_live = !s.is_terminal();
            apply(s)
        })?;
        self.ended_if(was_live, &updated);
        Ok(updated)
    }

    fn ended_if(&self, was_live: bool, session: &CallSession) {
        if !was_live || !session.is_terminal() {
            return;
        }
        let hooks = self.teardown.read().clone();
        for hook in hooks {
            hook.call_ended(session);
        }
    }

    /// Remove terminated sessions that ended more than `grace` ago
    pub fn reap_terminated(&self, grace: Duration) -> usize {
        let cutoff = Utc::now() - grace;
        let removed = self.store.retain(&mut |s| {
            !(s.is_terminal() && s.ended_at.map(|t| t <= cutoff).unwrap_or(true))
        });
        if removed > 0 {
            debug!("Reaped {} terminated sessions", removed);
        }
        removed
    }
}
