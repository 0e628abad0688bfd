//! Call value objects

use serde::{Deserialize, Serialize};
use std::fmt;

/// Call direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// Inbound call from the carrier gateway
    Inbound,
    /// Outbound call towards the carrier gateway
    Outbound,
    /// Internal call between registered devices
    Internal,
}

impl CallDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallDirection::Inbound => "inbound",
            CallDirection::Outbound => "outbound",
            CallDirection::Internal => "internal",
        }
    }
}

/// Call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// Callee is being alerted
    Ringing,
    /// Call has been answered and media is flowing
    Active,
    /// Call is on hold, media re-routed to the hold source
    OnHold,
    /// A transfer is in progress
    Transferring,
    /// Call has ended
    Terminated,
}

/// Every permitted `(from, to)` pair. Anything absent is rejected.
pub const TRANSITIONS: &[(CallState, CallState)] = &[
    (CallState::Ringing, CallState::Active),
    (CallState::Ringing, CallState::Terminated),
    (CallState::Active, CallState::OnHold),
    (CallState::Active, CallState::Transferring),
    (CallState::Active, CallState::Terminated),
    (CallState::OnHold, CallState::Active),
    (CallState::OnHold, CallState::Terminated),
    (CallState::Transferring, CallState::Active),
    (CallState::Transferring, CallState::Terminated),
];

impl CallState {
    pub const ALL: [CallState; 5] = [
        CallState::Ringing,
        CallState::Active,
        CallState::OnHold,
        CallState::Transferring,
        CallState::Terminated,
    ];

    /// Check if state transition is valid
    pub fn can_transition_to(&self, new_state: CallState) -> bool {
        TRANSITIONS.contains(&(*self, new_state))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Terminated)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Ringing => "ringing",
            CallState::Active => "active",
            CallState::OnHold => "on_hold",
            CallState::Transferring => "transferring",
            CallState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// In-flight operation holding a session's mutation claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingOperation {
    Hold,
    Resume,
    BlindTransfer,
    AttendedTransfer,
    CompleteTransfer,
    CancelTransfer,
}

impl PendingOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            PendingOperation::Hold => "hold",
            PendingOperation::Resume => "resume",
            PendingOperation::BlindTransfer => "blind_transfer",
            PendingOperation::AttendedTransfer => "attended_transfer",
            PendingOperation::CompleteTransfer => "complete_transfer",
            PendingOperation::CancelTransfer => "cancel_transfer",
        }
    }
}

impl fmt::Display for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_state_transitions() {
        assert!(CallState::Ringing.can_transition_to(CallState::Active));
        assert!(CallState::Ringing.can_transition_to(CallState::Terminated));
        assert!(CallState::Active.can_transition_to(CallState::OnHold));
        assert!(CallState::OnHold.can_transition_to(CallState::Active));
        assert!(CallState::Active.can_transition_to(CallState::Transferring));
        assert!(CallState::Transferring.can_transition_to(CallState::Active));
        assert!(CallState::Transferring.can_transition_to(CallState::Terminated));
    }

    #[test]
    fn test_invalid_state_transitions() {
        assert!(!CallState::Ringing.can_transition_to(CallState::OnHold));
        assert!(!CallState::Ringing.can_transition_to(CallState::Transferring));
        assert!(!CallState::OnHold.can_transition_to(CallState::Transferring));
        assert!(!CallState::Active.can_transition_to(CallState::Active));
        assert!(!CallState::Transferring.can_transition_to(CallState::OnHold));
    }

    #[test]
    fn test_terminal_state_is_final() {
        for next in CallState::ALL {
            assert!(!CallState::Terminated.can_transition_to(next));
        }
    }

    #[test]
    fn test_every_non_terminal_state_can_hang_up() {
        for state in CallState::ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(state.can_transition_to(CallState::Terminated), "{state}");
        }
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&CallState::OnHold).unwrap();
        assert_eq!(json, "\"on_hold\"");
        assert_eq!(CallState::OnHold.to_string(), "on_hold");
    }
}
