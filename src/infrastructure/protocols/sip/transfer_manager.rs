//! Blind and attended call transfer (RFC 3515 REFER, RFC 3891 Replaces)

use super::signaling::SignalingClient;
use crate::config::TransferConfig;
use crate::domain::call::{CallSession, CallState, PendingOperation, SessionRegistry};
use crate::domain::shared::{DomainError, Result};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

const END_REASON_TRANSFERRED: &str = "transferred";

fn transfer_failed(message: impl Into<String>) -> DomainError {
    DomainError::TransferFailed(message.into())
}

/// A missing session is a transfer failure, everything else passes through
fn missing_as_failure(e: DomainError) -> DomainError {
    match e {
        DomainError::NotFound(what) => transfer_failed(format!("{} not found", what)),
        other => other,
    }
}

/// User part of a SIP/tel URI, used as the dialed number of the new leg
fn number_of(uri: &str) -> String {
    let stripped = uri
        .trim_matches(|c| c == '<' || c == '>')
        .trim_start_matches("sips:")
        .trim_start_matches("sip:")
        .trim_start_matches("tel:");
    stripped
        .split(['@', ';'])
        .next()
        .unwrap_or(stripped)
        .to_string()
}

fn validate_target(target: &str) -> Result<()> {
    let target = target.trim_matches(|c| c == '<' || c == '>');
    let valid = ["sip:", "sips:", "tel:"]
        .iter()
        .any(|scheme| target.starts_with(scheme) && target.len() > scheme.len());
    if valid {
        Ok(())
    } else {
        Err(transfer_failed(format!("invalid transfer target '{}'", target)))
    }
}

pub struct TransferManager {
    registry: SessionRegistry,
    signaling: Arc<dyn SignalingClient>,
    config: RwLock<TransferConfig>,
}

impl TransferManager {
    pub fn new(
        config: TransferConfig,
        registry: SessionRegistry,
        signaling: Arc<dyn SignalingClient>,
    ) -> Self {
        Self {
            registry,
            signaling,
            config: RwLock::new(config),
        }
    }

    pub fn reload(&self, config: TransferConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> TransferConfig {
        self.config.read().clone()
    }

    /// Redirect an active call to `target` without consultation.
    ///
    /// Returns the new session created for the redirected leg.
    pub async fn blind_transfer(&self, call_id: &str, target: &str) -> Result<CallSession> {
        validate_target(target)?;
        let op = PendingOperation::BlindTransfer;

        self.registry
            .claim(call_id, op, &[CallState::Active], |s| {
                transfer_failed(format!(
                    "call {} is {}, blind transfer requires active",
                    s.call_id,
                    s.state()
                ))
            })
            .map_err(missing_as_failure)?;

        let snapshot = self.registry.update_claimed(call_id, op, |s| {
            s.set_state(CallState::Transferring)?;
            s.transfer_target = Some(target.to_string());
            Ok(())
        });
        let snapshot = match snapshot {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.registry.release(call_id, op);
                return Err(e);
            }
        };

        if let Err(e) = self
            .signal(call_id, "REFER", self.signaling.send_refer(&snapshot, target, None))
            .await
        {
            // Back to where we started; the call is still up
            let _ = self.registry.commit(call_id, op, |s| {
                s.set_state(CallState::Active)?;
                s.clear_transfer_linkage();
                Ok(())
            });
            warn!("Blind transfer of {} to {} failed: {}", call_id, target, e);
            return Err(e);
        }

        let original = self.registry.commit(call_id, op, |s| {
            s.set_state(CallState::Terminated)?;
            s.end_reason = Some(END_REASON_TRANSFERRED.to_string());
            Ok(())
        })?;

        let mut redirected = CallSession::new(
            Uuid::new_v4().to_string(),
            original.direction,
            original.from_number.clone(),
            number_of(target),
            original.local_uri.clone(),
            target.to_string(),
        )
        .with_transferred_from(call_id);
        redirected.device_id = original.device_id.clone();
        let redirected = self.registry.create_session(redirected)?;

        info!(
            "Call {} blind-transferred to {} as {}",
            call_id, target, redirected.call_id
        );
        Ok(redirected)
    }

    /// Link an active call to its consultation call.
    ///
    /// Lookup of the consult session and the linkage happen as one atomic
    /// step, so the consult call cannot vanish in between.
    pub fn attended_transfer(
        &self,
        call_id: &str,
        consult_call_id: &str,
    ) -> Result<(CallSession, CallSession)> {
        if call_id == consult_call_id {
            return Err(transfer_failed(format!(
                "call {} cannot consult itself",
                call_id
            )));
        }

        let (primary, consult) = self
            .registry
            .update_pair(call_id, consult_call_id, |primary, consult| {
                if let Some(current) = primary.pending() {
                    return Err(DomainError::invalid_transition(
                        &primary.call_id,
                        format!("{} ({} in progress)", primary.state(), current),
                        PendingOperation::AttendedTransfer,
                    ));
                }
                if primary.state() != CallState::Active {
                    return Err(transfer_failed(format!(
                        "call {} is {}, attended transfer requires active",
                        primary.call_id,
                        primary.state()
                    )));
                }
                if !matches!(consult.state(), CallState::Active | CallState::OnHold) {
                    return Err(transfer_failed(format!(
                        "consult call {} is {}",
                        consult.call_id,
                        consult.state()
                    )));
                }

                primary.set_state(CallState::Transferring)?;
                primary.consult_call_id = Some(consult.call_id.clone());
                primary.transfer_target = Some(consult.remote_uri.clone());
                Ok(())
            })
            .map_err(missing_as_failure)?;

        info!(
            "Call {} linked to consult call {} for attended transfer",
            call_id, consult_call_id
        );
        Ok((primary, consult))
    }

    /// Merge the linked calls: the consult leg replaces the primary
    pub async fn complete_transfer(&self, call_id: &str) -> Result<CallSession> {
        let op = PendingOperation::CompleteTransfer;
        let primary = self
            .registry
            .claim(call_id, op, &[CallState::Transferring], |s| {
                transfer_failed(format!(
                    "call {} is {}, nothing to complete",
                    s.call_id,
                    s.state()
                ))
            })
            .map_err(missing_as_failure)?;

        let consult = match primary
            .consult_call_id
            .as_deref()
            .and_then(|id| self.registry.get(id))
            .filter(|c| !c.is_terminal())
        {
            Some(consult) => consult,
            None => {
                self.registry.release(call_id, op);
                return Err(transfer_failed(format!(
                    "call {} has no live consult call",
                    call_id
                )));
            }
        };

        if let Err(e) = self
            .signal(
                call_id,
                "REFER",
                self.signaling.send_refer(
                    &primary,
                    &consult.remote_uri,
                    Some(consult.call_id.clone()),
                ),
            )
            .await
        {
            self.registry.release(call_id, op);
            warn!("Attended transfer of {} failed: {}", call_id, e);
            return Err(e);
        }

        let merged = self
            .registry
            .update_pair(call_id, &consult.call_id, |primary, consult| {
                primary.ensure_claimed(op)?;
                if consult.is_terminal() {
                    return Err(transfer_failed(format!(
                        "consult call {} ended during transfer",
                        consult.call_id
                    )));
                }
                primary.set_state(CallState::Terminated)?;
                primary.end_reason = Some(END_REASON_TRANSFERRED.to_string());
                consult.transferred_from = Some(primary.call_id.clone());
                Ok(())
            });

        match merged {
            Ok((_, consult)) => {
                info!(
                    "Attended transfer complete: {} replaced by {}",
                    call_id, consult.call_id
                );
                Ok(consult)
            }
            Err(e) => {
                self.registry.release(call_id, op);
                Err(e)
            }
        }
    }

    /// Abort a transfer before it completes
    pub fn cancel_transfer(&self, call_id: &str) -> Result<CallSession> {
        let op = PendingOperation::CancelTransfer;
        self.registry
            .claim(call_id, op, &[CallState::Transferring], |s| {
                transfer_failed(format!(
                    "call {} is {}, no transfer to cancel",
                    s.call_id,
                    s.state()
                ))
            })
            .map_err(missing_as_failure)?;

        let restored = self.registry.commit(call_id, op, |s| {
            s.set_state(CallState::Active)?;
            s.clear_transfer_linkage();
            Ok(())
        })?;
        info!("Transfer of {} cancelled", call_id);
        Ok(restored)
    }

    /// Calls with a transfer in progress
    pub fn pending_transfers(&self) -> Vec<CallSession> {
        self.registry
            .list()
            .into_iter()
            .filter(|s| s.state() == CallState::Transferring)
            .collect()
    }

    async fn signal<F>(&self, call_id: &str, what: &str, request: F) -> Result<()>
    where
        F: Future<Output = std::result::Result<(), super::signaling::SignalingError>>,
    {
        let timeout = self.config.read().signaling_timeout();
        match tokio::time::timeout(timeout, request).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(transfer_failed(format!(
                "{} for {} failed: {}",
                what, call_id, e
            ))),
            Err(_) => Err(transfer_failed(format!(
                "{} for {} timed out after {:?}",
                what, call_id, timeout
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::CallDirection;
    use crate::infrastructure::protocols::sip::signaling::{MockSignalingClient, SignalingError};

    fn active_call(registry: &SessionRegistry, id: &str, remote: &str) {
        registry
            .create_session(CallSession::new(
                id,
                CallDirection::Inbound,
                "+15550001111",
                "1001",
                "sip:1001@pbx.local",
                remote,
            ))
            .unwrap();
        registry.answer(id).unwrap();
    }

    fn manager(registry: &SessionRegistry, client: MockSignalingClient) -> TransferManager {
        TransferManager::new(TransferConfig::default(), registry.clone(), Arc::new(client))
    }

    #[tokio::test]
    async fn test_blind_transfer_creates_new_leg() {
        let registry = SessionRegistry::in_memory();
        active_call(&registry, "a", "sip:+15550001111@carrier.example");
        let mut client = MockSignalingClient::new();
        client
            .expect_send_refer()
            .withf(|_, target, replaces| target.to_string() == "sip:2002@pbx.local" && replaces.is_none())
            .times(1)
            .returning(|_, _, _| Ok(()));
        let transfers = manager(&registry, client);

        let redirected = transfers
            .blind_transfer("a", "sip:2002@pbx.local")
            .await
            .unwrap();
        assert_eq!(redirected.state(), CallState::Ringing);
        assert_eq!(redirected.transferred_from.as_deref(), Some("a"));
        assert_eq!(redirected.to_number, "2002");

        let original = registry.get("a").unwrap();
        assert_eq!(original.state(), CallState::Terminated);
        assert_eq!(original.end_reason.as_deref(), Some("transferred"));
    }

    #[tokio::test]
    async fn test_blind_transfer_failure_restores_active() {
        let registry = SessionRegistry::in_memory();
        active_call(&registry, "a", "sip:+15550001111@carrier.example");
        let mut client = MockSignalingClient::new();
        client.expect_send_refer().returning(|_, _, _| {
            Err(SignalingError::Rejected {
                code: 403,
                reason: "Forbidden".to_string(),
            })
        });
        let transfers = manager(&registry, client);

        let err = transfers
            .blind_transfer("a", "sip:2002@pbx.local")
            .await
            .unwrap_err();
        assert!(matches!(err, DomainError::TransferFailed(_)));

        let session = registry.get("a").unwrap();
        assert_eq!(session.state(), CallState::Active);
        assert!(session.transfer_target.is_none());
        assert!(session.pending().is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[tokio::test]
    async fn test_blind_transfer_rejects_bad_target() {
        let registry = SessionRegistry::in_memory();
        active_call(&registry, "a", "sip:x@carrier.example");
        let mut client = MockSignalingClient::new();
        client.expect_send_refer().never();
        let transfers = manager(&registry, client);

        assert!(matches!(
            transfers.blind_transfer("a", "2002").await,
            Err(DomainError::TransferFailed(_))
        ));
        assert!(matches!(
            transfers.blind_transfer("missing", "sip:2002@pbx.local").await,
            Err(DomainError::TransferFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_attended_transfer_requires_distinct_live_consult() {
        let registry = SessionRegistry::in_memory();
        active_call(&registry, "a", "sip:x@carrier.example");
        let transfers = manager(&registry, MockSignalingClient::new());

        assert!(matches!(
            transfers.attended_transfer("a", "a"),
            Err(DomainError::TransferFailed(_))
        ));
        assert!(matches!(
            transfers.attended_transfer("a", "nope"),
            Err(DomainError::TransferFailed(_))
        ));

        registry
            .create_session(CallSession::new(
                "b",
                CallDirection::Internal,
                "1001",
                "2002",
                "sip:1001@pbx.local",
                "sip:2002@pbx.local",
            ))
            .unwrap();
        // Consult still ringing
        assert!(matches!(
            transfers.attended_transfer("a", "b"),
            Err(DomainError::TransferFailed(_))
        ));
        assert_eq!(registry.get("a").unwrap().state(), CallState::Active);
        assert!(registry.get("a").unwrap().consult_call_id.is_none());
    }

    #[tokio::test]
    async fn test_complete_transfer_merges() {
        let registry = SessionRegistry::in_memory();
        active_call(&registry, "a", "sip:+15550001111@carrier.example");
        active_call(&registry, "b", "sip:2002@pbx.local");
        let mut client = MockSignalingClient::new();
        client
            .expect_send_refer()
            .withf(|session, target, replaces| {
                session.call_id == "a"
                    && target.to_string() == "sip:2002@pbx.local"
                    && replaces.as_deref() == Some("b")
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let transfers = manager(&registry, client);

        transfers.attended_transfer("a", "b").unwrap();
        let consult = transfers.complete_transfer("a").await.unwrap();

        assert_eq!(consult.call_id, "b");
        assert_eq!(consult.transferred_from.as_deref(), Some("a"));
        assert_eq!(registry.get("a").unwrap().state(), CallState::Terminated);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_requires_transferring() {
        let registry = SessionRegistry::in_memory();
        active_call(&registry, "a", "sip:x@carrier.example");
        let transfers = manager(&registry, MockSignalingClient::new());

        assert!(matches!(
            transfers.cancel_transfer("a"),
            Err(DomainError::TransferFailed(_))
        ));
        assert!(transfers.pending_transfers().is_empty());
    }
}
