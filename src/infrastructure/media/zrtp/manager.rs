//! ZRTP manager: one key-agreement session per call plus the peer cache
//!
//! Sessions reach Secured either through a retained secret both sides
//! prove knowledge of, or through an explicit SAS confirmation. A SAS
//! rejection is terminal and raises a [`SecurityWarning`].

use super::cache::ZidCache;
use super::kdf::{retained_secret_id, total_hash, KeyMaterial, Role, Zid, RS_ID_LEN};
use super::session::{ZrtpSession, ZrtpSessionInfo, ZrtpState};
use crate::config::ZrtpConfig;
use crate::domain::shared::{DomainError, Result};
use crate::infrastructure::media::srtp::SrtpMasterKey;
use chrono::{DateTime, Utc};
use p256::ecdh::EphemeralSecret;
use p256::PublicKey;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

const WARNING_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityWarningKind {
    /// Users reported different SAS values
    SasMismatch,
    /// Peer could not prove the retained secret we hold for it
    CacheMismatch,
}

/// Possible interception of a call's key exchange
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityWarning {
    pub call_id: String,
    pub peer_zid: String,
    pub kind: SecurityWarningKind,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// SRTP master keys for both directions of a secured call
#[derive(Debug, Clone)]
pub struct ZrtpSrtpKeys {
    pub local: SrtpMasterKey,
    pub remote: SrtpMasterKey,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZrtpStateCounts {
    pub discovery: usize,
    pub negotiating: usize,
    pub secured: usize,
    pub failed: usize,
}

impl ZrtpStateCounts {
    pub fn get(&self, state: ZrtpState) -> usize {
        match state {
            ZrtpState::Discovery => self.discovery,
            ZrtpState::Negotiating => self.negotiating,
            ZrtpState::Secured => self.secured,
            ZrtpState::Failed => self.failed,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZrtpStatus {
    pub enabled: bool,
    pub local_zid: String,
    pub cache_ttl_days: u32,
    pub cached_peers: usize,
    pub sessions: ZrtpStateCounts,
}

pub struct ZrtpManager {
    config: RwLock<ZrtpConfig>,
    cache: ZidCache,
    sessions: RwLock<HashMap<String, ZrtpSession>>,
    warnings: broadcast::Sender<SecurityWarning>,
}

impl ZrtpManager {
    pub fn new(config: ZrtpConfig) -> Result<Self> {
        let cache = match &config.cache_path {
            Some(path) => ZidCache::open(path, config.cache_ttl())?,
            None => ZidCache::ephemeral(config.cache_ttl()),
        };
        Ok(Self::with_cache(config, cache))
    }

    pub fn with_cache(config: ZrtpConfig, cache: ZidCache) -> Self {
        let (warnings, _) = broadcast::channel(WARNING_CHANNEL_CAPACITY);
        info!("ZRTP manager ready, local ZID {}", hex::encode(cache.local_zid()));
        Self {
            config: RwLock::new(config),
            cache,
            sessions: RwLock::new(HashMap::new()),
            warnings,
        }
    }

    pub fn local_zid(&self) -> Zid {
        self.cache.local_zid()
    }

    pub fn cache(&self) -> &ZidCache {
        &self.cache
    }

    pub fn subscribe_warnings(&self) -> broadcast::Receiver<SecurityWarning> {
        self.warnings.subscribe()
    }

    /// Open the call's session in Discovery
    pub fn start(&self, call_id: &str, peer_zid: Zid) -> Result<ZrtpSessionInfo> {
        let local_zid = self.local_zid();
        if peer_zid == local_zid {
            return Err(DomainError::ValidationError(
                "Peer ZID equals local ZID".to_string(),
            ));
        }
        let role = Role::of(&local_zid, &peer_zid);

        let local_rs1_id = match self.cache.get(&peer_zid).filter(|e| e.verified) {
            Some(entry) => Some(retained_secret_id(&entry.rs1, role.label())?),
            None => None,
        };

        let secret = EphemeralSecret::random(&mut rand::rngs::OsRng);
        let public_key = secret.public_key().to_sec1_bytes().to_vec();

        let mut sessions = self.sessions.write();
        if sessions.contains_key(call_id) {
            return Err(DomainError::AlreadyExists(format!(
                "ZRTP session for call {}",
                call_id
            )));
        }

        let session = ZrtpSession {
            call_id: call_id.to_string(),
            state: ZrtpState::Discovery,
            peer_zid,
            role,
            sas: None,
            is_cached: false,
            sas_verified: false,
            started_at: Utc::now(),
            secured_at: None,
            failure_reason: None,
            dh_secret: Some(secret),
            public_key,
            local_rs1_id,
            keys: None,
            pending_rs1: None,
        };
        let info = session.info();
        sessions.insert(call_id.to_string(), session);

        debug!(
            "ZRTP session {} started with peer {} as {}",
            call_id,
            info.peer_zid,
            role.label()
        );
        Ok(info)
    }

    fn with_session<T>(
        &self,
        call_id: &str,
        f: impl FnOnce(&mut ZrtpSession) -> Result<T>,
    ) -> Result<T> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(call_id)
            .ok_or_else(|| DomainError::NotFound(format!("ZRTP session for call {}", call_id)))?;
        f(session)
    }

    /// Hello/HelloACK exchanged; key agreement begins
    pub fn hello_acknowledged(&self, call_id: &str) -> Result<ZrtpSessionInfo> {
        self.with_session(call_id, |s| {
            s.advance(ZrtpState::Negotiating)?;
            Ok(s.info())
        })
    }

    /// SEC1-encoded P-256 public value for our DHPart
    pub fn local_public_key(&self, call_id: &str) -> Result<Vec<u8>> {
        self.with_session(call_id, |s| Ok(s.public_key.clone()))
    }

    /// rs1ID we present to the peer, when we hold a verified secret for it
    pub fn local_rs1_id(&self, call_id: &str) -> Result<Option<[u8; RS_ID_LEN]>> {
        self.with_session(call_id, |s| Ok(s.local_rs1_id))
    }

    /// Finish the DH exchange and compute the SAS.
    ///
    /// When the peer proves the verified retained secret the session is
    /// Secured immediately with `is_cached`; otherwise it stays in
    /// Negotiating until [`ZrtpManager::verify_sas`].
    pub fn complete_key_agreement(
        &self,
        call_id: &str,
        peer_public_key: &[u8],
        peer_rs1_id: Option<[u8; RS_ID_LEN]>,
    ) -> Result<ZrtpSessionInfo> {
        let local_zid = self.local_zid();
        let mut cache_mismatch = false;

        let (info, peer_zid, next_rs1, matched) = self.with_session(call_id, |s| {
            if s.state != ZrtpState::Negotiating || s.keys.is_some() {
                return Err(DomainError::invalid_transition(
                    call_id,
                    s.state,
                    "key agreement",
                ));
            }

            let peer_key = match PublicKey::from_sec1_bytes(peer_public_key) {
                Ok(key) => key,
                Err(_) => {
                    s.failure_reason = Some("invalid peer public value".to_string());
                    s.advance(ZrtpState::Failed)?;
                    return Err(DomainError::ValidationError(
                        "Invalid peer DH public value".to_string(),
                    ));
                }
            };
            let secret = s.dh_secret.take().ok_or_else(|| {
                DomainError::Internal(format!("ZRTP session {} lost its DH secret", call_id))
            })?;
            let shared = secret.diffie_hellman(&peer_key);

            let (zid_i, zid_r, hash) = match s.role {
                Role::Initiator => (
                    local_zid,
                    s.peer_zid,
                    total_hash(&s.public_key, peer_public_key),
                ),
                Role::Responder => (
                    s.peer_zid,
                    local_zid,
                    total_hash(peer_public_key, &s.public_key),
                ),
            };

            let cached = self.cache.get(&s.peer_zid).filter(|e| e.verified);
            let mut matched = false;
            if let Some(entry) = &cached {
                if let Some(presented) = peer_rs1_id {
                    matched =
                        retained_secret_id(&entry.rs1, s.role.other().label())? == presented;
                }
                // A peer with a verified secret that cannot prove it is a mismatch
                cache_mismatch = !matched;
            }
            let s1 = if matched {
                cached.as_ref().map(|e| e.rs1.as_slice())
            } else {
                None
            };

            let keys = KeyMaterial::derive(
                shared.raw_secret_bytes().as_slice(),
                &zid_i,
                &zid_r,
                &hash,
                s1,
            );
            s.sas = Some(keys.sas()?);
            let next_rs1 = keys.retained_secret()?;
            s.keys = Some(keys);

            if matched {
                s.is_cached = true;
                s.advance(ZrtpState::Secured)?;
            } else {
                s.pending_rs1 = Some(next_rs1.clone());
            }
            Ok((s.info(), s.peer_zid, next_rs1, matched))
        })?;

        // Cache and file I/O happen after the session lock is released.
        // A verified secret is only replaced by a proven or SAS-confirmed one.
        if !cache_mismatch {
            self.cache.store(peer_zid, next_rs1, matched);
            self.persist_cache();
        }

        if cache_mismatch {
            self.raise_warning(
                call_id,
                &info.peer_zid,
                SecurityWarningKind::CacheMismatch,
                "Peer did not prove the retained secret; SAS must be compared",
            );
        }

        if matched {
            info!("ZRTP call {} secured from cache", call_id);
        } else {
            info!("ZRTP call {} awaiting SAS confirmation", call_id);
        }
        Ok(info)
    }

    /// Record the users' SAS comparison
    pub fn verify_sas(&self, call_id: &str, verified: bool) -> Result<ZrtpSessionInfo> {
        let (info, peer, confirmed) = self.with_session(call_id, |s| {
            if s.sas.is_none() {
                return Err(DomainError::ValidationError(format!(
                    "ZRTP call {} has no SAS yet",
                    call_id
                )));
            }

            if verified {
                match s.state {
                    ZrtpState::Negotiating => s.advance(ZrtpState::Secured)?,
                    ZrtpState::Secured => {}
                    other => {
                        return Err(DomainError::invalid_transition(
                            call_id,
                            other,
                            ZrtpState::Secured,
                        ))
                    }
                }
                s.sas_verified = true;
            } else {
                s.failure_reason = Some("SAS mismatch".to_string());
                s.advance(ZrtpState::Failed)?;
            }
            let confirmed = if verified { s.pending_rs1.take() } else { None };
            Ok((s.info(), s.peer_zid, confirmed))
        })?;

        if verified {
            match confirmed {
                Some(rs1) => self.cache.store(peer, rs1, true),
                None => {
                    self.cache.mark_verified(&peer);
                }
            }
        } else {
            // Never trust the secret from a disputed exchange
            self.cache.remove(&peer);
        }
        self.persist_cache();

        if verified {
            info!("ZRTP call {} SAS confirmed", call_id);
        } else {
            self.raise_warning(
                call_id,
                &info.peer_zid,
                SecurityWarningKind::SasMismatch,
                "SAS mismatch reported; the call may be intercepted",
            );
        }
        Ok(info)
    }

    /// Move a session to Failed (protocol error, peer error, timeout)
    pub fn fail(&self, call_id: &str, reason: &str) -> Result<ZrtpSessionInfo> {
        let info = self.with_session(call_id, |s| {
            s.failure_reason = Some(reason.to_string());
            s.advance(ZrtpState::Failed)?;
            Ok(s.info())
        })?;
        warn!("ZRTP call {} failed: {}", call_id, reason);
        Ok(info)
    }

    /// Destroy the call's session
    pub fn end_call(&self, call_id: &str) -> bool {
        let removed = self.sessions.write().remove(call_id).is_some();
        if removed {
            debug!("ZRTP session {} destroyed", call_id);
        }
        removed
    }

    pub fn get(&self, call_id: &str) -> Option<ZrtpSessionInfo> {
        self.sessions.read().get(call_id).map(|s| s.info())
    }

    pub fn list(&self) -> Vec<ZrtpSessionInfo> {
        let mut sessions: Vec<_> = self.sessions.read().values().map(|s| s.info()).collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        sessions
    }

    /// SRTP master keys once the call is Secured
    pub fn srtp_keys(&self, call_id: &str) -> Option<ZrtpSrtpKeys> {
        let sessions = self.sessions.read();
        let session = sessions.get(call_id)?;
        if session.state != ZrtpState::Secured {
            return None;
        }
        let keys = session.keys.as_ref()?;
        Some(ZrtpSrtpKeys {
            local: keys.srtp_master(session.role).ok()?,
            remote: keys.srtp_master(session.role.other()).ok()?,
        })
    }

    /// Fail sessions stuck before a SAS exists for longer than the timeout
    pub fn expire_stalled(&self) -> usize {
        let timeout = self.config.read().negotiation_timeout();
        let Ok(timeout) = chrono::Duration::from_std(timeout) else {
            return 0;
        };
        let cutoff = Utc::now() - timeout;

        let mut expired = Vec::new();
        {
            let mut sessions = self.sessions.write();
            for session in sessions.values_mut() {
                let stalled = matches!(
                    session.state,
                    ZrtpState::Discovery | ZrtpState::Negotiating
                ) && session.sas.is_none()
                    && session.started_at <= cutoff;
                if stalled {
                    session.failure_reason = Some("negotiation timeout".to_string());
                    if session.advance(ZrtpState::Failed).is_ok() {
                        expired.push(session.call_id.clone());
                    }
                }
            }
        }

        for call_id in &expired {
            warn!("ZRTP call {} negotiation timed out", call_id);
        }
        expired.len()
    }

    /// Periodic upkeep: stalled sessions and expired cache entries
    pub fn maintenance(&self) -> (usize, usize) {
        let timed_out = self.expire_stalled();
        let purged = self.cache.purge_expired();
        if purged > 0 {
            debug!("Purged {} expired ZRTP cache entries", purged);
            self.persist_cache();
        }
        (timed_out, purged)
    }

    pub fn reload(&self, config: ZrtpConfig) {
        if config.cache_path != self.config.read().cache_path {
            warn!("zrtp.cache_path changes take effect after restart");
        }
        self.cache.set_ttl(config.cache_ttl());
        *self.config.write() = config;
        info!("ZRTP configuration reloaded");
    }

    pub fn state_counts(&self) -> ZrtpStateCounts {
        let mut counts = ZrtpStateCounts::default();
        for session in self.sessions.read().values() {
            match session.state {
                ZrtpState::Discovery => counts.discovery += 1,
                ZrtpState::Negotiating => counts.negotiating += 1,
                ZrtpState::Secured => counts.secured += 1,
                ZrtpState::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn status(&self) -> ZrtpStatus {
        let config = self.config.read().clone();
        ZrtpStatus {
            enabled: config.enabled,
            local_zid: hex::encode(self.local_zid()),
            cache_ttl_days: config.cache_ttl_days,
            cached_peers: self.cache.len(),
            sessions: self.state_counts(),
        }
    }

    fn persist_cache(&self) {
        if let Err(e) = self.cache.persist() {
            warn!("ZRTP cache not saved: {}", e);
        }
    }

    fn raise_warning(&self, call_id: &str, peer_zid: &str, kind: SecurityWarningKind, message: &str) {
        warn!(
            target: "security",
            call_id = %call_id,
            peer_zid = %peer_zid,
            "{}",
            message
        );
        // No subscribers is fine
        let _ = self.warnings.send(SecurityWarning {
            call_id: call_id.to_string(),
            peer_zid: peer_zid.to_string(),
            kind,
            message: message.to_string(),
            raised_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ZrtpManager {
        ZrtpManager::new(ZrtpConfig::default()).unwrap()
    }

    /// Drive both ends of one call up to SAS computation
    fn exchange(a: &ZrtpManager, b: &ZrtpManager, call_id: &str) -> (ZrtpSessionInfo, ZrtpSessionInfo) {
        a.start(call_id, b.local_zid()).unwrap();
        b.start(call_id, a.local_zid()).unwrap();
        a.hello_acknowledged(call_id).unwrap();
        b.hello_acknowledged(call_id).unwrap();

        let pk_a = a.local_public_key(call_id).unwrap();
        let pk_b = b.local_public_key(call_id).unwrap();
        let id_a = a.local_rs1_id(call_id).unwrap();
        let id_b = b.local_rs1_id(call_id).unwrap();

        let info_a = a.complete_key_agreement(call_id, &pk_b, id_b).unwrap();
        let info_b = b.complete_key_agreement(call_id, &pk_a, id_a).unwrap();
        (info_a, info_b)
    }

    #[test]
    fn test_first_call_needs_sas() {
        let (a, b) = (manager(), manager());
        let (info_a, info_b) = exchange(&a, &b, "call-1");

        assert_eq!(info_a.state, ZrtpState::Negotiating);
        assert!(info_a.sas.is_some());
        assert_eq!(info_a.sas, info_b.sas);
        assert!(!info_a.is_cached);
        assert!(a.srtp_keys("call-1").is_none());

        let secured = a.verify_sas("call-1", true).unwrap();
        assert_eq!(secured.state, ZrtpState::Secured);
        assert!(secured.secured_at.is_some());
    }

    #[test]
    fn test_srtp_keys_mirror() {
        let (a, b) = (manager(), manager());
        exchange(&a, &b, "call-1");
        a.verify_sas("call-1", true).unwrap();
        b.verify_sas("call-1", true).unwrap();

        let keys_a = a.srtp_keys("call-1").unwrap();
        let keys_b = b.srtp_keys("call-1").unwrap();
        assert_eq!(keys_a.local, keys_b.remote);
        assert_eq!(keys_a.remote, keys_b.local);
    }

    #[test]
    fn test_returning_peer_is_cached() {
        let (a, b) = (manager(), manager());
        exchange(&a, &b, "call-1");
        a.verify_sas("call-1", true).unwrap();
        b.verify_sas("call-1", true).unwrap();
        a.end_call("call-1");
        b.end_call("call-1");

        let (info_a, info_b) = exchange(&a, &b, "call-2");
        assert_eq!(info_a.state, ZrtpState::Secured);
        assert!(info_a.is_cached);
        assert!(info_b.is_cached);
        assert_eq!(info_a.sas, info_b.sas);
    }

    #[tokio::test]
    async fn test_unproven_peer_cannot_replace_verified_secret() {
        let (a, b) = (manager(), manager());
        exchange(&a, &b, "call-1");
        a.verify_sas("call-1", true).unwrap();
        b.verify_sas("call-1", true).unwrap();
        let trusted = a.cache().get(&b.local_zid()).unwrap();
        assert!(trusted.verified);

        // Same ZID, no retained secret to show
        let mut warnings = a.subscribe_warnings();
        let impostor = manager();
        a.start("call-2", b.local_zid()).unwrap();
        impostor.start("call-2", a.local_zid()).unwrap();
        a.hello_acknowledged("call-2").unwrap();
        impostor.hello_acknowledged("call-2").unwrap();
        let pk = impostor.local_public_key("call-2").unwrap();

        let info = a.complete_key_agreement("call-2", &pk, None).unwrap();
        assert_eq!(info.state, ZrtpState::Negotiating);
        assert!(!info.is_cached);

        let warning = warnings.recv().await.unwrap();
        assert_eq!(warning.kind, SecurityWarningKind::CacheMismatch);
        assert_eq!(warning.call_id, "call-2");

        let kept = a.cache().get(&b.local_zid()).unwrap();
        assert!(kept.verified);
        assert_eq!(kept.rs1, trusted.rs1);

        // The next call from the real peer still resolves from cache
        a.end_call("call-2");
        let (info_a, info_b) = exchange(&a, &b, "call-3");
        assert!(info_a.is_cached);
        assert!(info_b.is_cached);
    }

    #[test]
    fn test_confirmed_sas_replaces_secret_after_mismatch() {
        let (a, b) = (manager(), manager());
        exchange(&a, &b, "call-1");
        a.verify_sas("call-1", true).unwrap();
        let before = a.cache().get(&b.local_zid()).unwrap();

        a.start("call-2", b.local_zid()).unwrap();
        b.start("call-2", a.local_zid()).unwrap();
        a.hello_acknowledged("call-2").unwrap();
        b.hello_acknowledged("call-2").unwrap();
        let pk_b = b.local_public_key("call-2").unwrap();
        a.complete_key_agreement("call-2", &pk_b, Some([0u8; RS_ID_LEN]))
            .unwrap();
        assert_eq!(a.cache().get(&b.local_zid()).unwrap().rs1, before.rs1);

        let secured = a.verify_sas("call-2", true).unwrap();
        assert_eq!(secured.state, ZrtpState::Secured);
        let after = a.cache().get(&b.local_zid()).unwrap();
        assert!(after.verified);
        assert_ne!(after.rs1, before.rs1);
    }

    #[tokio::test]
    async fn test_sas_mismatch_fails_and_warns() {
        let (a, b) = (manager(), manager());
        let mut warnings = a.subscribe_warnings();
        exchange(&a, &b, "call-1");

        let failed = a.verify_sas("call-1", false).unwrap();
        assert_eq!(failed.state, ZrtpState::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("SAS mismatch"));

        let warning = warnings.recv().await.unwrap();
        assert_eq!(warning.kind, SecurityWarningKind::SasMismatch);
        assert_eq!(warning.call_id, "call-1");
        assert!(a.cache().get(&b.local_zid()).is_none());

        // Failed is terminal
        assert!(a.verify_sas("call-1", true).is_err());
    }

    #[test]
    fn test_secured_only_moves_to_failed() {
        let (a, b) = (manager(), manager());
        exchange(&a, &b, "call-1");
        a.verify_sas("call-1", true).unwrap();

        assert!(a.hello_acknowledged("call-1").is_err());
        assert_eq!(a.get("call-1").unwrap().state, ZrtpState::Secured);

        assert_eq!(a.fail("call-1", "peer error").unwrap().state, ZrtpState::Failed);
        assert!(a.srtp_keys("call-1").is_none());
    }

    #[test]
    fn test_one_session_per_call() {
        let (a, b) = (manager(), manager());
        a.start("call-1", b.local_zid()).unwrap();
        assert!(matches!(
            a.start("call-1", b.local_zid()),
            Err(DomainError::AlreadyExists(_))
        ));
        assert!(a.end_call("call-1"));
        assert!(a.get("call-1").is_none());
        assert!(!a.end_call("call-1"));
    }

    #[test]
    fn test_invalid_public_key_fails_session() {
        let (a, b) = (manager(), manager());
        a.start("call-1", b.local_zid()).unwrap();
        a.hello_acknowledged("call-1").unwrap();
        assert!(a.complete_key_agreement("call-1", &[4u8; 10], None).is_err());
        assert_eq!(a.get("call-1").unwrap().state, ZrtpState::Failed);
    }

    #[test]
    fn test_stalled_negotiation_times_out() {
        let a = ZrtpManager::new(ZrtpConfig {
            negotiation_timeout_secs: 0,
            ..Default::default()
        })
        .unwrap();
        a.start("call-1", [0xee; 12]).unwrap();

        assert_eq!(a.maintenance().0, 1);
        let info = a.get("call-1").unwrap();
        assert_eq!(info.state, ZrtpState::Failed);
        assert_eq!(a.state_counts().failed, 1);
    }
}
