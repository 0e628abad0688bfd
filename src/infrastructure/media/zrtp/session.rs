//! Per-call ZRTP session state

use super::kdf::{KeyMaterial, Role, Zid};
use crate::domain::shared::{DomainError, Result};
use chrono::{DateTime, Utc};
use p256::ecdh::EphemeralSecret;
use serde::{Deserialize, Serialize};
use std::fmt;

/// ZRTP protocol state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZrtpState {
    /// Hello exchange
    Discovery,
    /// Key agreement, then waiting for SAS confirmation
    Negotiating,
    Secured,
    Failed,
}

impl ZrtpState {
    pub const ALL: [ZrtpState; 4] = [
        ZrtpState::Discovery,
        ZrtpState::Negotiating,
        ZrtpState::Secured,
        ZrtpState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ZrtpState::Discovery => "discovery",
            ZrtpState::Negotiating => "negotiating",
            ZrtpState::Secured => "secured",
            ZrtpState::Failed => "failed",
        }
    }

    /// States only move forward; Secured may still fall to Failed
    pub fn can_advance_to(&self, next: ZrtpState) -> bool {
        matches!(
            (self, next),
            (ZrtpState::Discovery, ZrtpState::Negotiating)
                | (ZrtpState::Discovery, ZrtpState::Failed)
                | (ZrtpState::Negotiating, ZrtpState::Secured)
                | (ZrtpState::Negotiating, ZrtpState::Failed)
                | (ZrtpState::Secured, ZrtpState::Failed)
        )
    }
}

impl fmt::Display for ZrtpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a session handed to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZrtpSessionInfo {
    pub call_id: String,
    pub state: ZrtpState,
    pub peer_zid: String,
    pub sas: Option<String>,
    /// Secured through a verified retained secret, no SAS check needed
    pub is_cached: bool,
    pub sas_verified: bool,
    pub started_at: DateTime<Utc>,
    pub secured_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

pub(crate) struct ZrtpSession {
    pub call_id: String,
    pub state: ZrtpState,
    pub peer_zid: Zid,
    pub role: Role,
    pub sas: Option<String>,
    pub is_cached: bool,
    pub sas_verified: bool,
    pub started_at: DateTime<Utc>,
    pub secured_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    /// Our DH secret, consumed by key agreement
    pub dh_secret: Option<EphemeralSecret>,
    pub public_key: Vec<u8>,
    /// rs1ID we present to the peer, if we hold a verified secret for it
    pub local_rs1_id: Option<[u8; 8]>,
    pub keys: Option<KeyMaterial>,
    /// Retained secret from this exchange, cached as verified once the SAS is confirmed
    pub pending_rs1: Option<Vec<u8>>,
}

impl ZrtpSession {
    pub fn advance(&mut self, next: ZrtpState) -> Result<()> {
        if !self.state.can_advance_to(next) {
            return Err(DomainError::invalid_transition(&self.call_id, self.state, next));
        }
        if next == ZrtpState::Secured {
            self.secured_at = Some(Utc::now());
        }
        if next == ZrtpState::Failed {
            // Key material is useless once the exchange is distrusted
            self.dh_secret = None;
            self.keys = None;
            self.pending_rs1 = None;
        }
        self.state = next;
        Ok(())
    }

    pub fn info(&self) -> ZrtpSessionInfo {
        ZrtpSessionInfo {
            call_id: self.call_id.clone(),
            state: self.state,
            peer_zid: hex::encode(self.peer_zid),
            sas: self.sas.clone(),
            is_cached: self.is_cached,
            sas_verified: self.sas_verified,
            started_at: self.started_at,
            secured_at: self.secured_at,
            failure_reason: self.failure_reason.clone(),
        }
    }
}
