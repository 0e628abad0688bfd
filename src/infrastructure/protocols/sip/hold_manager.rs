/// Call hold/resume manager using re-INVITE
use super::sdp::MediaDirection;
use super::signaling::SignalingClient;
use crate::config::HoldConfig;
use crate::domain::call::{CallSession, CallState, PendingOperation, SessionRegistry};
use crate::domain::shared::{DomainError, Result};
use crate::infrastructure::media::moh::MohManager;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Puts calls on hold and back, serving hold audio while held.
///
/// The session is claimed before the re-INVITE goes out and the new state is
/// committed only after the peer accepts, so a failed or slow re-INVITE never
/// leaves the registry half-updated.
pub struct HoldManager {
    registry: SessionRegistry,
    signaling: Arc<dyn SignalingClient>,
    moh: Option<Arc<MohManager>>,
    config: RwLock<HoldConfig>,
}

impl HoldManager {
    pub fn new(
        config: HoldConfig,
        registry: SessionRegistry,
        signaling: Arc<dyn SignalingClient>,
    ) -> Self {
        Self {
            registry,
            signaling,
            moh: None,
            config: RwLock::new(config),
        }
    }

    pub fn with_moh(mut self, moh: Arc<MohManager>) -> Self {
        self.moh = Some(moh);
        self
    }

    pub fn reload(&self, config: HoldConfig) {
        info!(
            "Hold manager reloaded (signaling timeout {}s)",
            config.signaling_timeout_secs
        );
        *self.config.write() = config;
    }

    pub fn config(&self) -> HoldConfig {
        self.config.read().clone()
    }

    /// Put an active call on hold
    pub async fn put_on_hold(&self, call_id: &str) -> Result<CallSession> {
        let snapshot = self.claim(call_id, PendingOperation::Hold, CallState::Active)?;

        if let Err(e) = self.reinvite(&snapshot, MediaDirection::SendOnly).await {
            self.registry.release(call_id, PendingOperation::Hold);
            warn!("Hold of {} failed: {}", call_id, e);
            return Err(e);
        }

        let held = self
            .registry
            .commit(call_id, PendingOperation::Hold, |s| {
                s.set_state(CallState::OnHold)
            })?;

        self.start_hold_audio(call_id);
        info!("Call {} placed on hold", call_id);
        Ok(held)
    }

    /// Resume a held call
    pub async fn resume(&self, call_id: &str) -> Result<CallSession> {
        let snapshot = self.claim(call_id, PendingOperation::Resume, CallState::OnHold)?;

        if let Err(e) = self.reinvite(&snapshot, MediaDirection::SendRecv).await {
            self.registry.release(call_id, PendingOperation::Resume);
            warn!("Resume of {} failed: {}", call_id, e);
            return Err(e);
        }

        let resumed = self
            .registry
            .commit(call_id, PendingOperation::Resume, |s| {
                s.set_state(CallState::Active)
            })?;

        if let Some(moh) = &self.moh {
            moh.stop(call_id);
        }
        info!("Call {} resumed from hold", call_id);
        Ok(resumed)
    }

    /// Start playback, then confirm the call is still held; a hangup racing
    /// the hold commit may already have run its teardown
    fn start_hold_audio(&self, call_id: &str) {
        let Some(moh) = &self.moh else {
            return;
        };
        if !moh.start(call_id) {
            debug!("Hold audio already playing for {}", call_id);
        }
        if !self.is_on_hold(call_id) {
            moh.stop(call_id);
            debug!("Call {} left hold before audio started", call_id);
        }
    }

    pub fn is_on_hold(&self, call_id: &str) -> bool {
        self.registry
            .get(call_id)
            .map(|s| s.state() == CallState::OnHold)
            .unwrap_or(false)
    }

    /// Calls currently on hold
    pub fn held_calls(&self) -> Vec<CallSession> {
        self.registry
            .list()
            .into_iter()
            .filter(|s| s.state() == CallState::OnHold)
            .collect()
    }

    fn claim(&self, call_id: &str, op: PendingOperation, required: CallState) -> Result<CallSession> {
        self.registry
            .claim(call_id, op, &[required], |s| {
                DomainError::HoldFailed(format!(
                    "call {} is {}, {} requires {}",
                    s.call_id,
                    s.state(),
                    op,
                    required
                ))
            })
            .map_err(|e| match e {
                DomainError::NotFound(what) => DomainError::HoldFailed(format!("{} not found", what)),
                other => other,
            })
    }

    async fn reinvite(&self, session: &CallSession, direction: MediaDirection) -> Result<()> {
        let timeout = self.config.read().signaling_timeout();
        match tokio::time::timeout(timeout, self.signaling.send_reinvite(session, direction)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(DomainError::HoldFailed(format!(
                "re-INVITE ({}) for {} failed: {}",
                direction, session.call_id, e
            ))),
            Err(_) => Err(DomainError::HoldFailed(format!(
                "re-INVITE ({}) for {} timed out after {:?}",
                direction, session.call_id, timeout
            ))),
        }
    }
}
