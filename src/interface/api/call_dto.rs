//! Call API DTOs

use crate::domain::call::CallSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Call summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSummary {
    pub call_id: String,
    pub direction: String,
    pub state: String,
    pub from_number: String,
    pub to_number: String,
    pub local_uri: String,
    pub remote_uri: String,
    pub duration_seconds: i64,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consult_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transferred_from: Option<String>,
}

impl From<&CallSession> for CallSummary {
    fn from(session: &CallSession) -> Self {
        CallSummary {
            call_id: session.call_id.clone(),
            direction: session.direction.as_str().to_string(),
            state: session.state().as_str().to_string(),
            from_number: session.from_number.clone(),
            to_number: session.to_number.clone(),
            local_uri: session.local_uri.clone(),
            remote_uri: session.remote_uri.clone(),
            duration_seconds: session.duration_seconds(),
            started_at: session.started_at,
            answered_at: session.answered_at,
            ended_at: session.ended_at,
            end_reason: session.end_reason.clone(),
            transfer_target: session.transfer_target.clone(),
            consult_call_id: session.consult_call_id.clone(),
            transferred_from: session.transferred_from.clone(),
        }
    }
}

/// Call list response
#[derive(Debug, Serialize, Deserialize)]
pub struct CallListResponse {
    pub calls: Vec<CallSummary>,
    pub total: usize,
    pub active: usize,
}

impl CallListResponse {
    pub fn from_sessions(sessions: &[CallSession]) -> Self {
        let calls: Vec<CallSummary> = sessions.iter().map(CallSummary::from).collect();
        let active = sessions.iter().filter(|s| !s.is_terminal()).count();
        Self {
            total: calls.len(),
            active,
            calls,
        }
    }
}
