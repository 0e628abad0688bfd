//! Shared fixtures for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use pbx_core::config::PbxConfig;
use pbx_core::domain::call::{CallDirection, CallSession};
use pbx_core::domain::mwi::MwiSubscription;
use pbx_core::infrastructure::protocols::sip::{MediaDirection, SignalingClient, SignalingError};
use pbx_core::Pbx;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct SentRefer {
    pub call_id: String,
    pub target: String,
    pub replaces: Option<String>,
}

/// Signaling peer with a configurable delay and failure set
#[derive(Default)]
pub struct FakeSignaling {
    delay: Duration,
    reject_reinvite: bool,
    reject_refer: bool,
    failing_contacts: Vec<String>,
    pub reinvites: Mutex<Vec<(String, MediaDirection)>>,
    pub refers: Mutex<Vec<SentRefer>>,
    pub notifies: Mutex<Vec<(String, String)>>,
    pub ended: Mutex<Vec<String>>,
}

impl FakeSignaling {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejecting_reinvite(mut self) -> Self {
        self.reject_reinvite = true;
        self
    }

    pub fn rejecting_refer(mut self) -> Self {
        self.reject_refer = true;
        self
    }

    /// NOTIFY to this contact fails
    pub fn failing_contact(mut self, contact: &str) -> Self {
        self.failing_contacts.push(contact.to_string());
        self
    }

    async fn wait(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl SignalingClient for FakeSignaling {
    async fn send_reinvite(
        &self,
        session: &CallSession,
        direction: MediaDirection,
    ) -> Result<(), SignalingError> {
        self.wait().await;
        self.reinvites
            .lock()
            .push((session.call_id.clone(), direction));
        if self.reject_reinvite {
            return Err(SignalingError::Rejected {
                code: 488,
                reason: "Not Acceptable Here".to_string(),
            });
        }
        Ok(())
    }

    async fn send_refer(
        &self,
        session: &CallSession,
        target: &str,
        replaces: Option<String>,
    ) -> Result<(), SignalingError> {
        self.wait().await;
        self.refers.lock().push(SentRefer {
            call_id: session.call_id.clone(),
            target: target.to_string(),
            replaces,
        });
        if self.reject_refer {
            return Err(SignalingError::Rejected {
                code: 603,
                reason: "Decline".to_string(),
            });
        }
        Ok(())
    }

    async fn send_notify(
        &self,
        subscription: &MwiSubscription,
        body: &str,
        _terminated: bool,
    ) -> Result<(), SignalingError> {
        self.wait().await;
        if self.failing_contacts.contains(&subscription.contact) {
            return Err(SignalingError::Transport("host unreachable".to_string()));
        }
        self.notifies
            .lock()
            .push((subscription.contact.clone(), body.to_string()));
        Ok(())
    }

    fn call_ended(&self, call_id: &str) {
        self.ended.lock().push(call_id.to_string());
    }
}

pub async fn build_pbx(config: PbxConfig, signaling: Arc<FakeSignaling>) -> Pbx {
    let client: Arc<dyn SignalingClient> = signaling;
    Pbx::builder(config, client).build().await.unwrap()
}

/// Create a call and answer it
pub fn active_call(pbx: &Pbx, call_id: &str, remote: &str) -> CallSession {
    pbx.registry()
        .create_session(CallSession::new(
            call_id,
            CallDirection::Inbound,
            remote,
            "1001",
            "sip:1001@pbx.local",
            format!("sip:{}@carrier.example.com", remote),
        ))
        .unwrap();
    pbx.registry().answer(call_id).unwrap()
}
