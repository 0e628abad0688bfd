use crate::config::MwiConfig;
use crate::domain::shared::{DomainError, Result};
use crate::domain::voicemail::{Alert, NotificationDispatcher, VoicemailCounter};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message Waiting Indicator (MWI) for voicemail notifications
/// Implements RFC 3842 - Message Summary Event Package

/// Mailbox counters for an address-of-record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxState {
    pub aor: String,
    pub new_messages: u32,
    pub old_messages: u32,
    pub new_urgent: u32,
    pub old_urgent: u32,
    pub last_updated: DateTime<Utc>,
}

impl MailboxState {
    pub fn empty(aor: &str) -> Self {
        Self {
            aor: aor.to_string(),
            new_messages: 0,
            old_messages: 0,
            new_urgent: 0,
            old_urgent: 0,
            last_updated: Utc::now(),
        }
    }

    pub fn has_new_messages(&self) -> bool {
        self.new_messages > 0 || self.new_urgent > 0
    }

    /// Generate RFC 3842 message-summary body
    pub fn message_summary_body(&self) -> String {
        let waiting = if self.has_new_messages() { "yes" } else { "no" };
        format!(
            "Messages-Waiting: {}\r\nMessage-Account: {}\r\nVoice-Message: {}/{} ({}/{})\r\n",
            waiting, self.aor, self.new_messages, self.old_messages, self.new_urgent, self.old_urgent
        )
    }
}

/// MWI subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MwiSubscription {
    pub id: Uuid,
    pub aor: String,
    /// Contact URI for NOTIFY messages
    pub contact: String,
    /// Call-ID of the subscription dialog
    pub dialog_id: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl MwiSubscription {
    pub fn new(aor: &str, contact: &str, expires_seconds: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            aor: aor.to_string(),
            contact: contact.to_string(),
            dialog_id: Uuid::new_v4().to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(expires_seconds as i64),
            last_notified_at: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn refresh(&mut self, expires_seconds: u32) {
        self.expires_at = Utc::now() + Duration::seconds(expires_seconds as i64);
    }

    pub fn time_until_expiry(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds()
    }
}

/// Storage port for MWI subscriptions
pub trait SubscriptionStore: Send + Sync {
    /// Create or refresh the subscription bound to `(aor, contact)`
    fn upsert_binding(
        &self,
        aor: &str,
        contact: &str,
        merge: &mut dyn FnMut(Option<MwiSubscription>) -> MwiSubscription,
    ) -> MwiSubscription;

    fn get(&self, id: &Uuid) -> Option<MwiSubscription>;

    fn list(&self) -> Vec<MwiSubscription>;

    fn update(
        &self,
        id: &Uuid,
        mutation: &mut dyn FnMut(&mut MwiSubscription),
    ) -> Option<MwiSubscription>;

    fn remove(&self, id: &Uuid) -> Option<MwiSubscription>;

    fn retain(&self, keep: &mut dyn FnMut(&MwiSubscription) -> bool) -> usize;
}

#[derive(Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: RwLock<HashMap<Uuid, MwiSubscription>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SubscriptionStore for InMemorySubscriptionStore {
    fn upsert_binding(
        &self,
        aor: &str,
        contact: &str,
        merge: &mut dyn FnMut(Option<MwiSubscription>) -> MwiSubscription,
    ) -> MwiSubscription {
        let mut subscriptions = self.subscriptions.write();
        let existing = subscriptions
            .values()
            .find(|s| s.aor == aor && s.contact == contact)
            .cloned();
        if let Some(old) = &existing {
            subscriptions.remove(&old.id);
        }
        let merged = merge(existing);
        subscriptions.insert(merged.id, merged.clone());
        merged
    }

    fn get(&self, id: &Uuid) -> Option<MwiSubscription> {
        self.subscriptions.read().get(id).cloned()
    }

    fn list(&self) -> Vec<MwiSubscription> {
        self.subscriptions.read().values().cloned().collect()
    }

    fn update(
        &self,
        id: &Uuid,
        mutation: &mut dyn FnMut(&mut MwiSubscription),
    ) -> Option<MwiSubscription> {
        let mut subscriptions = self.subscriptions.write();
        let sub = subscriptions.get_mut(id)?;
        mutation(sub);
        Some(sub.clone())
    }

    fn remove(&self, id: &Uuid) -> Option<MwiSubscription> {
        self.subscriptions.write().remove(id)
    }

    fn retain(&self, keep: &mut dyn FnMut(&MwiSubscription) -> bool) -> usize {
        let mut subscriptions = self.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|_, s| keep(s));
        before - subscriptions.len()
    }
}

/// Delivers message-summary NOTIFY requests to a subscriber
#[async_trait]
pub trait MwiNotifier: Send + Sync {
    async fn notify(
        &self,
        subscription: &MwiSubscription,
        body: &str,
        terminated: bool,
    ) -> std::result::Result<(), String>;
}

/// Outcome of one NOTIFY fan-out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyReport {
    /// Subscribers a NOTIFY was sent to, regardless of outcome
    pub attempted: usize,
    pub delivered: usize,
    pub failed: usize,
}

/// Consistent view of counters and subscriptions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MwiSnapshot {
    pub mailboxes: Vec<MailboxState>,
    pub subscriptions: Vec<MwiSubscription>,
}

/// MWI manager for handling subscriptions and notifications
pub struct MwiManager {
    config: RwLock<MwiConfig>,
    mailboxes: RwLock<HashMap<String, MailboxState>>,
    subscriptions: Arc<dyn SubscriptionStore>,
    notifier: Arc<dyn MwiNotifier>,
    voicemail: Option<Arc<dyn VoicemailCounter>>,
    dispatcher: Option<Arc<dyn NotificationDispatcher>>,
}

impl MwiManager {
    pub fn new(
        config: MwiConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        notifier: Arc<dyn MwiNotifier>,
    ) -> Self {
        Self {
            config: RwLock::new(config),
            mailboxes: RwLock::new(HashMap::new()),
            subscriptions,
            notifier,
            voicemail: None,
            dispatcher: None,
        }
    }

    pub fn with_voicemail_counter(mut self, counter: Arc<dyn VoicemailCounter>) -> Self {
        self.voicemail = Some(counter);
        self
    }

    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn NotificationDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn reload(&self, config: MwiConfig) {
        info!("MWI configuration reloaded");
        *self.config.write() = config;
    }

    pub fn config(&self) -> MwiConfig {
        self.config.read().clone()
    }

    fn clamp_expires(&self, requested: u32) -> u32 {
        let config = self.config.read();
        requested.clamp(config.min_expires, config.max_expires)
    }

    /// Create or refresh a subscription and send the initial NOTIFY
    pub async fn subscribe(&self, aor: &str, contact: &str, expires_seconds: u32) -> Result<Uuid> {
        if expires_seconds == 0 {
            return Err(DomainError::ValidationError(
                "Cannot subscribe with 0 expiry".to_string(),
            ));
        }
        let expires = self.clamp_expires(expires_seconds);

        let subscription = self
            .subscriptions
            .upsert_binding(aor, contact, &mut |existing| match existing {
                Some(mut sub) => {
                    sub.refresh(expires);
                    sub
                }
                None => MwiSubscription::new(aor, contact, expires),
            });
        info!(
            "MWI subscription {} for {} -> {} (expires in {}s)",
            subscription.id, aor, contact, expires
        );

        let state = self.get_state(aor).unwrap_or_else(|| MailboxState::empty(aor));
        self.deliver(&subscription, &state.message_summary_body(), false)
            .await;

        Ok(subscription.id)
    }

    /// Refresh an existing subscription; zero expiry unsubscribes
    pub async fn refresh(&self, id: &Uuid, expires_seconds: u32) -> Result<()> {
        if expires_seconds == 0 {
            return self.unsubscribe(id).await;
        }
        let expires = self.clamp_expires(expires_seconds);
        self.subscriptions
            .update(id, &mut |sub| sub.refresh(expires))
            .map(|_| ())
            .ok_or_else(|| DomainError::NotFound(format!("MWI subscription {}", id)))
    }

    /// Remove a subscription and send a final NOTIFY (best effort)
    pub async fn unsubscribe(&self, id: &Uuid) -> Result<()> {
        let subscription = self
            .subscriptions
            .remove(id)
            .ok_or_else(|| DomainError::NotFound(format!("MWI subscription {}", id)))?;
        info!("MWI subscription {} removed", id);

        let state = self
            .get_state(&subscription.aor)
            .unwrap_or_else(|| MailboxState::empty(&subscription.aor));
        self.deliver(&subscription, &state.message_summary_body(), true)
            .await;
        Ok(())
    }

    /// Upsert new/old counts (urgent counts untouched) and fan out
    pub async fn update_state(&self, aor: &str, new_count: u32, old_count: u32) -> NotifyReport {
        let (urgent_new, urgent_old) = self
            .get_state(aor)
            .map(|s| (s.new_urgent, s.old_urgent))
            .unwrap_or((0, 0));
        self.update_state_with_urgent(aor, new_count, old_count, urgent_new, urgent_old)
            .await
    }

    pub async fn update_state_with_urgent(
        &self,
        aor: &str,
        new_count: u32,
        old_count: u32,
        urgent_new: u32,
        urgent_old: u32,
    ) -> NotifyReport {
        let previous_new = {
            let mut mailboxes = self.mailboxes.write();
            let state = mailboxes
                .entry(aor.to_string())
                .or_insert_with(|| MailboxState::empty(aor));
            let previous_new = state.new_messages;
            state.new_messages = new_count;
            state.old_messages = old_count;
            state.new_urgent = urgent_new;
            state.old_urgent = urgent_old;
            state.last_updated = Utc::now();
            previous_new
        };
        debug!(
            "Mailbox {} updated: {}/{} ({}/{})",
            aor, new_count, old_count, urgent_new, urgent_old
        );

        if new_count > previous_new {
            self.dispatch_alert(aor, new_count);
        }

        self.notify_all_subscribers(aor).await
    }

    /// Refresh counters for an AOR from voicemail storage
    pub async fn sync_from_voicemail(&self, aor: &str) -> Result<NotifyReport> {
        let counter = self.voicemail.as_ref().ok_or_else(|| {
            DomainError::ValidationError("No voicemail counter configured".to_string())
        })?;
        let counts = counter
            .mailbox_counts(aor)
            .await
            .map_err(|e| DomainError::Internal(format!("Voicemail lookup for {}: {}", aor, e)))?;

        Ok(self
            .update_state_with_urgent(
                aor,
                counts.new_messages,
                counts.old_messages,
                counts.new_urgent,
                counts.old_urgent,
            )
            .await)
    }

    /// Send the current summary to every live subscription for the AOR.
    ///
    /// One subscriber failing never stops delivery to the rest.
    pub async fn notify_all_subscribers(&self, aor: &str) -> NotifyReport {
        let state = self.get_state(aor).unwrap_or_else(|| MailboxState::empty(aor));
        let body = state.message_summary_body();
        let targets = self.list_subscriptions(aor);

        let outcomes = join_all(
            targets
                .iter()
                .map(|sub| self.deliver(sub, &body, false)),
        )
        .await;

        let delivered = outcomes.iter().filter(|ok| **ok).count();
        let report = NotifyReport {
            attempted: targets.len(),
            delivered,
            failed: targets.len() - delivered,
        };

        if report.attempted > 0 {
            info!(
                "MWI NOTIFY for {}: {}/{} delivered",
                aor, report.delivered, report.attempted
            );
        }
        metrics::counter!("pbx_mwi_notify_total", "outcome" => "delivered")
            .increment(report.delivered as u64);
        metrics::counter!("pbx_mwi_notify_total", "outcome" => "failed")
            .increment(report.failed as u64);

        report
    }

    async fn deliver(&self, subscription: &MwiSubscription, body: &str, terminated: bool) -> bool {
        let timeout = self.config.read().notify_timeout();
        let result =
            tokio::time::timeout(timeout, self.notifier.notify(subscription, body, terminated))
                .await;

        match result {
            Ok(Ok(())) => {
                self.subscriptions.update(&subscription.id, &mut |sub| {
                    sub.last_notified_at = Some(Utc::now());
                });
                true
            }
            Ok(Err(e)) => {
                warn!(
                    "MWI NOTIFY to {} ({}) failed: {}",
                    subscription.contact, subscription.id, e
                );
                false
            }
            Err(_) => {
                warn!(
                    "MWI NOTIFY to {} ({}) timed out after {:?}",
                    subscription.contact, subscription.id, timeout
                );
                false
            }
        }
    }

    fn dispatch_alert(&self, aor: &str, new_messages: u32) {
        let Some(dispatcher) = self.dispatcher.clone() else {
            return;
        };
        let alert = Alert::Voicemail {
            aor: aor.to_string(),
            new_messages,
        };
        tokio::spawn(async move {
            if let Err(e) = dispatcher.dispatch(alert).await {
                warn!("Voicemail alert dispatch failed: {}", e);
            }
        });
    }

    pub fn get_state(&self, aor: &str) -> Option<MailboxState> {
        self.mailboxes.read().get(aor).cloned()
    }

    pub fn get_subscription(&self, id: &Uuid) -> Option<MwiSubscription> {
        self.subscriptions.get(id).filter(|s| !s.is_expired())
    }

    /// Non-expired subscriptions for an AOR
    pub fn list_subscriptions(&self, aor: &str) -> Vec<MwiSubscription> {
        let now = Utc::now();
        self.subscriptions
            .list()
            .into_iter()
            .filter(|s| s.aor == aor && !s.is_expired_at(now))
            .collect()
    }

    pub fn snapshot(&self) -> MwiSnapshot {
        let mailboxes = self.mailboxes.read();
        let now = Utc::now();
        let mut subscriptions: Vec<MwiSubscription> = self
            .subscriptions
            .list()
            .into_iter()
            .filter(|s| !s.is_expired_at(now))
            .collect();
        subscriptions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let mut states: Vec<MailboxState> = mailboxes.values().cloned().collect();
        states.sort_by(|a, b| a.aor.cmp(&b.aor));

        MwiSnapshot {
            mailboxes: states,
            subscriptions,
        }
    }

    /// Cleanup expired subscriptions
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let removed = self.subscriptions.retain(&mut |s| !s.is_expired_at(now));
        if removed > 0 {
            debug!("Removed {} expired MWI subscriptions", removed);
        }
        removed
    }
}
