//! Call session entity

use super::value_object::{CallDirection, CallState, PendingOperation};
use crate::domain::shared::{DomainError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// A single call leg tracked by the session registry.
///
/// The registry owns the authoritative copy; everything handed out is a
/// snapshot. State only changes through [`CallSession::set_state`], which
/// enforces the transition table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    pub call_id: String,
    pub direction: CallDirection,
    state: CallState,
    pub from_number: String,
    pub to_number: String,
    pub local_uri: String,
    pub remote_uri: String,
    /// Owning registered device, if the local side is one of ours
    pub device_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<String>,
    pub transfer_target: Option<String>,
    /// B-leg of an attended transfer
    pub consult_call_id: Option<String>,
    /// Session this one was transferred from
    pub transferred_from: Option<String>,
    pending: Option<PendingOperation>,
}

impl CallSession {
    pub fn new(
        call_id: impl Into<String>,
        direction: CallDirection,
        from_number: impl Into<String>,
        to_number: impl Into<String>,
        local_uri: impl Into<String>,
        remote_uri: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            direction,
            state: CallState::Ringing,
            from_number: from_number.into(),
            to_number: to_number.into(),
            local_uri: local_uri.into(),
            remote_uri: remote_uri.into(),
            device_id: None,
            started_at: Utc::now(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            transfer_target: None,
            consult_call_id: None,
            transferred_from: None,
            pending: None,
        }
    }

    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_transferred_from(mut self, call_id: impl Into<String>) -> Self {
        self.transferred_from = Some(call_id.into());
        self
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn pending(&self) -> Option<PendingOperation> {
        self.pending
    }

    /// Apply a state transition, leaving the session untouched if the table forbids it
    pub fn set_state(&mut self, next: CallState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(DomainError::invalid_transition(
                &self.call_id,
                self.state,
                next,
            ));
        }

        let now = Utc::now();
        if next == CallState::Active && self.answered_at.is_none() {
            self.answered_at = Some(now);
        }
        if next == CallState::Terminated {
            self.ended_at = Some(now);
            self.pending = None;
        }

        self.state = next;
        Ok(())
    }

    /// Take the per-session mutation claim for an in-flight operation
    pub(crate) fn claim(&mut self, op: PendingOperation) -> Result<()> {
        if let Some(current) = self.pending {
            return Err(DomainError::InvalidStateTransition {
                call_id: self.call_id.clone(),
                from: format!("{} ({} in progress)", self.state, current),
                to: op.to_string(),
            });
        }
        self.pending = Some(op);
        Ok(())
    }

    /// Verify the claim is still ours before committing the operation's result
    pub(crate) fn ensure_claimed(&self, op: PendingOperation) -> Result<()> {
        if self.pending == Some(op) {
            Ok(())
        } else {
            Err(DomainError::InvalidStateTransition {
                call_id: self.call_id.clone(),
                from: self.state.to_string(),
                to: format!("{} (claim lost)", op),
            })
        }
    }

    pub(crate) fn release(&mut self, op: PendingOperation) {
        if self.pending == Some(op) {
            self.pending = None;
        }
    }

    /// Talk time once answered, otherwise time since the session was created
    pub fn duration(&self) -> Duration {
        let end = self.ended_at.unwrap_or_else(Utc::now);
        let start = self.answered_at.unwrap_or(self.started_at);
        (end - start).max(Duration::zero())
    }

    pub fn duration_seconds(&self) -> i64 {
        self.duration().num_seconds()
    }

    pub(crate) fn clear_transfer_linkage(&mut self) {
        self.transfer_target = None;
        self.consult_call_id = None;
    }
}
