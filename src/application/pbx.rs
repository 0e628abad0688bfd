//! PBX facade: owns the managers and the background tasks
//!
//! A feature whose `enabled` flag is off is never constructed and its
//! accessor returns `None`.

use super::background::{spawn_certificate_renewal, spawn_periodic};
use crate::config::PbxConfig;
use crate::domain::call::{
    CallSession, CallTeardown, InMemorySessionStore, SessionRegistry, SessionStore,
};
use crate::domain::mwi::{InMemorySubscriptionStore, MwiManager, SubscriptionStore};
use crate::domain::registration::{InMemoryRegistrationStore, RegistrationStore};
use crate::domain::shared::Result;
use crate::domain::voicemail::{NotificationDispatcher, VoicemailCounter};
use crate::infrastructure::media::moh::MohManager;
use crate::infrastructure::media::srtp::SrtpPolicy;
use crate::infrastructure::media::zrtp::ZrtpManager;
use crate::infrastructure::protocols::sip::{
    HoldManager, Registrar, SignalingClient, SignalingNotifier, TransferManager,
};
use crate::infrastructure::tls::{CertificateIssuer, CertificateManager, TrunkTlsClient};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-call resources released when a call ends, however it ended
struct CallCleanup {
    moh: Option<Arc<MohManager>>,
    zrtp: Option<Arc<ZrtpManager>>,
    signaling: Arc<dyn SignalingClient>,
}

impl CallTeardown for CallCleanup {
    fn call_ended(&self, session: &CallSession) {
        let call_id = session.call_id.as_str();
        if let Some(moh) = &self.moh {
            moh.stop(call_id);
        }
        if let Some(zrtp) = &self.zrtp {
            zrtp.end_call(call_id);
        }
        self.signaling.call_ended(call_id);
        debug!("Released per-call resources of {}", call_id);
    }
}

/// Collaborators injected into [`Pbx`]; everything except signaling has an
/// in-memory or absent default
pub struct PbxBuilder {
    config: PbxConfig,
    signaling: Arc<dyn SignalingClient>,
    session_store: Option<Arc<dyn SessionStore>>,
    registration_store: Option<Arc<dyn RegistrationStore>>,
    subscription_store: Option<Arc<dyn SubscriptionStore>>,
    voicemail: Option<Arc<dyn VoicemailCounter>>,
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
    issuer: Option<Arc<dyn CertificateIssuer>>,
    trunk: Option<Arc<dyn TrunkTlsClient>>,
}

impl PbxBuilder {
    pub fn new(config: PbxConfig, signaling: Arc<dyn SignalingClient>) -> Self {
        Self {
            config,
            signaling,
            session_store: None,
            registration_store: None,
            subscription_store: None,
            voicemail: None,
            dispatcher: None,
            issuer: None,
            trunk: None,
        }
    }

    pub fn session_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn registration_store(mut self, store: Arc<dyn RegistrationStore>) -> Self {
        self.registration_store = Some(store);
        self
    }

    pub fn subscription_store(mut self, store: Arc<dyn SubscriptionStore>) -> Self {
        self.subscription_store = Some(store);
        self
    }

    pub fn voicemail_counter(mut self, counter: Arc<dyn VoicemailCounter>) -> Self {
        self.voicemail = Some(counter);
        self
    }

    pub fn notification_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn certificate_issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn trunk_client(mut self, trunk: Arc<dyn TrunkTlsClient>) -> Self {
        self.trunk = Some(trunk);
        self
    }

    pub async fn build(self) -> Result<Pbx> {
        let config = self.config;
        config.validate()?;

        let registry = SessionRegistry::new(
            self.session_store
                .unwrap_or_else(|| Arc::new(InMemorySessionStore::new())),
        );

        let moh = if config.moh.enabled {
            let moh = MohManager::new(config.moh.clone());
            match moh.load_configured() {
                Ok(Some(info)) => info!(
                    "Hold audio loaded: {} Hz, {} ch, {:.1}s",
                    info.sample_rate, info.channels, info.duration_secs
                ),
                Ok(None) => debug!("No hold audio configured"),
                Err(e) => warn!("Hold audio rejected, using fallback: {}", e),
            }
            Some(Arc::new(moh))
        } else {
            None
        };

        let hold = config.hold.enabled.then(|| {
            let manager =
                HoldManager::new(config.hold.clone(), registry.clone(), self.signaling.clone());
            Arc::new(match &moh {
                Some(moh) => manager.with_moh(moh.clone()),
                None => manager,
            })
        });

        let transfer = config.transfer.enabled.then(|| {
            Arc::new(TransferManager::new(
                config.transfer.clone(),
                registry.clone(),
                self.signaling.clone(),
            ))
        });

        let registrar = config.registrar.enabled.then(|| {
            Arc::new(Registrar::new(
                config.registrar.clone(),
                self.registration_store
                    .unwrap_or_else(|| Arc::new(InMemoryRegistrationStore::new())),
            ))
        });

        let mwi = if config.mwi.enabled {
            let mut manager = MwiManager::new(
                config.mwi.clone(),
                self.subscription_store
                    .unwrap_or_else(|| Arc::new(InMemorySubscriptionStore::new())),
                Arc::new(SignalingNotifier::new(self.signaling.clone())),
            );
            if let Some(counter) = self.voicemail {
                manager = manager.with_voicemail_counter(counter);
            }
            if let Some(dispatcher) = self.dispatcher {
                manager = manager.with_dispatcher(dispatcher);
            }
            Some(Arc::new(manager))
        } else {
            None
        };

        let zrtp = if config.zrtp.enabled {
            Some(Arc::new(ZrtpManager::new(config.zrtp.clone())?))
        } else {
            None
        };

        let srtp = if config.srtp.enabled {
            Some(Arc::new(SrtpPolicy::new(&config.srtp)?))
        } else {
            None
        };

        let certificates = if config.tls.enabled {
            let mut manager = CertificateManager::new(config.tls.clone())?;
            if let Some(issuer) = self.issuer {
                manager = manager.with_issuer(issuer);
            }
            if let Some(trunk) = self.trunk {
                manager = manager.with_trunk_client(trunk);
            }
            manager.initialize().await?;
            Some(Arc::new(manager))
        } else {
            None
        };

        registry.add_teardown(Arc::new(CallCleanup {
            moh: moh.clone(),
            zrtp: zrtp.clone(),
            signaling: self.signaling.clone(),
        }));

        info!(
            "PBX core ready (hold: {}, transfer: {}, moh: {}, mwi: {}, zrtp: {}, srtp: {}, tls: {}, registrar: {})",
            hold.is_some(),
            transfer.is_some(),
            moh.is_some(),
            mwi.is_some(),
            zrtp.is_some(),
            srtp.is_some(),
            certificates.is_some(),
            registrar.is_some()
        );

        Ok(Pbx {
            config: RwLock::new(config),
            registry,
            hold,
            transfer,
            moh,
            mwi,
            zrtp,
            srtp,
            certificates,
            registrar,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }
}

pub struct Pbx {
    config: RwLock<PbxConfig>,
    registry: SessionRegistry,
    hold: Option<Arc<HoldManager>>,
    transfer: Option<Arc<TransferManager>>,
    moh: Option<Arc<MohManager>>,
    mwi: Option<Arc<MwiManager>>,
    zrtp: Option<Arc<ZrtpManager>>,
    srtp: Option<Arc<SrtpPolicy>>,
    certificates: Option<Arc<CertificateManager>>,
    registrar: Option<Arc<Registrar>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Pbx {
    pub fn builder(config: PbxConfig, signaling: Arc<dyn SignalingClient>) -> PbxBuilder {
        PbxBuilder::new(config, signaling)
    }

    /// Snapshot of the configuration currently applied
    pub fn config(&self) -> PbxConfig {
        self.config.read().clone()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn hold(&self) -> Option<&Arc<HoldManager>> {
        self.hold.as_ref()
    }

    pub fn transfer(&self) -> Option<&Arc<TransferManager>> {
        self.transfer.as_ref()
    }

    pub fn moh(&self) -> Option<&Arc<MohManager>> {
        self.moh.as_ref()
    }

    pub fn mwi(&self) -> Option<&Arc<MwiManager>> {
        self.mwi.as_ref()
    }

    pub fn zrtp(&self) -> Option<&Arc<ZrtpManager>> {
        self.zrtp.as_ref()
    }

    pub fn srtp(&self) -> Option<&Arc<SrtpPolicy>> {
        self.srtp.as_ref()
    }

    pub fn certificates(&self) -> Option<&Arc<CertificateManager>> {
        self.certificates.as_ref()
    }

    pub fn registrar(&self) -> Option<&Arc<Registrar>> {
        self.registrar.as_ref()
    }

    /// All sessions, oldest first
    pub fn sessions(&self) -> Vec<CallSession> {
        self.registry.list()
    }

    pub fn session(&self, call_id: &str) -> Option<CallSession> {
        self.registry.get(call_id)
    }

    pub fn call_duration(&self, call_id: &str) -> Option<chrono::Duration> {
        self.registry.duration(call_id)
    }

    /// End a call; the registry's teardown hook releases hold audio, the
    /// ZRTP session and dialog state
    pub fn hangup(&self, call_id: &str, reason: &str) -> Result<CallSession> {
        self.registry.hangup(call_id, reason)
    }

    /// Push a new configuration snapshot into the running managers.
    ///
    /// Every section is checked before any manager changes, so a rejected
    /// snapshot leaves the running configuration untouched. Enabling a
    /// feature that was off at startup needs a restart.
    pub fn reload(&self, config: &PbxConfig) -> Result<()> {
        config.validate()?;
        if self.srtp.is_some() {
            SrtpPolicy::check(&config.srtp)?;
        }

        if let Some(hold) = &self.hold {
            hold.reload(config.hold.clone());
        }
        if let Some(transfer) = &self.transfer {
            transfer.reload(config.transfer.clone());
        }
        if let Some(moh) = &self.moh {
            moh.reload(config.moh.clone());
        }
        if let Some(mwi) = &self.mwi {
            mwi.reload(config.mwi.clone());
        }
        if let Some(zrtp) = &self.zrtp {
            zrtp.reload(config.zrtp.clone());
        }
        if let Some(srtp) = &self.srtp {
            srtp.reload(&config.srtp)?;
        }
        if let Some(certificates) = &self.certificates {
            certificates.reload_config(config.tls.clone())?;
        }
        if let Some(registrar) = &self.registrar {
            registrar.reload(config.registrar.clone());
        }
        *self.config.write() = config.clone();
        info!("Configuration reloaded");
        Ok(())
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the reapers and schedulers; each stops when the PBX shuts down
    pub fn spawn_background(&self) {
        let config = self.config();
        let token = self.shutdown.clone();
        let mut tasks = Vec::new();

        let registry = self.registry.clone();
        let grace = chrono::Duration::seconds(
            i64::try_from(config.calls.terminated_grace_secs).unwrap_or(i64::MAX),
        );
        tasks.push(spawn_periodic(
            "session-reaper",
            Duration::from_secs(config.calls.reap_interval_secs),
            token.clone(),
            move || {
                registry.reap_terminated(grace);
                async {}
            },
        ));

        if let Some(registrar) = self.registrar.clone() {
            let period = Duration::from_secs(registrar.config().reap_interval_secs);
            tasks.push(spawn_periodic(
                "registration-reaper",
                period,
                token.clone(),
                move || {
                    registrar.reap_expired();
                    async {}
                },
            ));
        }

        if let Some(mwi) = self.mwi.clone() {
            let period = Duration::from_secs(mwi.config().cleanup_interval_secs);
            tasks.push(spawn_periodic("mwi-cleanup", period, token.clone(), move || {
                mwi.cleanup_expired();
                async {}
            }));
        }

        if let Some(zrtp) = self.zrtp.clone() {
            let period = Duration::from_secs(config.zrtp.maintenance_interval_secs);
            tasks.push(spawn_periodic(
                "zrtp-maintenance",
                period,
                token.clone(),
                move || {
                    zrtp.maintenance();
                    async {}
                },
            ));
        }

        if let Some(certificates) = self.certificates.clone() {
            let period = certificates.config().check_interval();
            tasks.push(spawn_certificate_renewal(certificates, period, token.clone()));
        }

        info!("Started {} background tasks", tasks.len());
        self.tasks.lock().extend(tasks);
    }

    /// Cancel the background tasks and wait for them to finish
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        info!("PBX core stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::call::{CallDirection, CallState};
    use crate::domain::mwi::MwiSubscription;
    use crate::infrastructure::protocols::sip::{MediaDirection, SignalingError};
    use async_trait::async_trait;

    struct AcceptAll;

    #[async_trait]
    impl SignalingClient for AcceptAll {
        async fn send_reinvite(
            &self,
            _session: &CallSession,
            _direction: MediaDirection,
        ) -> std::result::Result<(), SignalingError> {
            Ok(())
        }

        async fn send_refer(
            &self,
            _session: &CallSession,
            _target: &str,
            _replaces: Option<String>,
        ) -> std::result::Result<(), SignalingError> {
            Ok(())
        }

        async fn send_notify(
            &self,
            _subscription: &MwiSubscription,
            _body: &str,
            _terminated: bool,
        ) -> std::result::Result<(), SignalingError> {
            Ok(())
        }
    }

    fn call(id: &str) -> CallSession {
        CallSession::new(
            id,
            CallDirection::Inbound,
            "+15551230000",
            "1001",
            "sip:+15551230000@carrier.example.com",
            "sip:1001@pbx.local",
        )
    }

    #[tokio::test]
    async fn test_disabled_features_are_absent() {
        let mut config = PbxConfig::default();
        config.hold.enabled = false;
        config.mwi.enabled = false;
        config.zrtp.enabled = false;

        let pbx = Pbx::builder(config, Arc::new(AcceptAll)).build().await.unwrap();
        assert!(pbx.hold().is_none());
        assert!(pbx.mwi().is_none());
        assert!(pbx.zrtp().is_none());
        assert!(pbx.certificates().is_none());
        assert!(pbx.transfer().is_some());
        assert!(pbx.registrar().is_some());
    }

    #[tokio::test]
    async fn test_hangup_stops_hold_audio() {
        let pbx = Pbx::builder(PbxConfig::default(), Arc::new(AcceptAll))
            .build()
            .await
            .unwrap();
        pbx.registry().create_session(call("c1")).unwrap();
        pbx.registry().answer("c1").unwrap();

        pbx.hold().unwrap().put_on_hold("c1").await.unwrap();
        assert!(pbx.moh().unwrap().is_playing("c1"));

        let ended = pbx.hangup("c1", "normal_clearing").unwrap();
        assert_eq!(ended.state(), CallState::Terminated);
        assert!(!pbx.moh().unwrap().is_playing("c1"));
        assert_eq!(pbx.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_transfer_releases_call_resources() {
        let pbx = Pbx::builder(PbxConfig::default(), Arc::new(AcceptAll))
            .build()
            .await
            .unwrap();
        pbx.registry().create_session(call("c1")).unwrap();
        pbx.registry().answer("c1").unwrap();
        let zrtp = pbx.zrtp().unwrap();
        zrtp.start("c1", [7u8; 12]).unwrap();

        pbx.transfer()
            .unwrap()
            .blind_transfer("c1", "sip:2002@pbx.local")
            .await
            .unwrap();

        assert_eq!(pbx.session("c1").unwrap().state(), CallState::Terminated);
        assert!(zrtp.get("c1").is_none());
    }

    #[tokio::test]
    async fn test_reload_is_all_or_nothing() {
        let pbx = Pbx::builder(PbxConfig::default(), Arc::new(AcceptAll))
            .build()
            .await
            .unwrap();

        let mut rejected = PbxConfig::default();
        rejected.hold.signaling_timeout_secs = 9;
        rejected.srtp.profiles = vec!["NULL_CIPHER".to_string()];
        assert!(pbx.reload(&rejected).is_err());
        assert_ne!(pbx.hold().unwrap().config().signaling_timeout_secs, 9);
        assert_ne!(pbx.config().hold.signaling_timeout_secs, 9);

        let mut accepted = PbxConfig::default();
        accepted.hold.signaling_timeout_secs = 9;
        pbx.reload(&accepted).unwrap();
        assert_eq!(pbx.hold().unwrap().config().signaling_timeout_secs, 9);
        assert_eq!(pbx.config().hold.signaling_timeout_secs, 9);
    }

    #[tokio::test]
    async fn test_shutdown_joins_background_tasks() {
        let pbx = Pbx::builder(PbxConfig::default(), Arc::new(AcceptAll))
            .build()
            .await
            .unwrap();
        pbx.spawn_background();
        assert!(!pbx.tasks.lock().is_empty());

        pbx.shutdown().await;
        assert!(pbx.shutdown_token().is_cancelled());
        assert!(pbx.tasks.lock().is_empty());
    }
}
