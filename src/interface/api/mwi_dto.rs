//! MWI API DTOs

use crate::domain::mwi::{MailboxState, MwiManager, MwiSubscription};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxDto {
    pub aor: String,
    pub new_messages: u32,
    pub old_messages: u32,
    pub new_urgent: u32,
    pub old_urgent: u32,
    pub messages_waiting: bool,
    pub last_updated: DateTime<Utc>,
}

impl From<&MailboxState> for MailboxDto {
    fn from(state: &MailboxState) -> Self {
        MailboxDto {
            aor: state.aor.clone(),
            new_messages: state.new_messages,
            old_messages: state.old_messages,
            new_urgent: state.new_urgent,
            old_urgent: state.old_urgent,
            messages_waiting: state.has_new_messages(),
            last_updated: state.last_updated,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionDto {
    pub id: Uuid,
    pub aor: String,
    pub contact: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: i64,
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl From<&MwiSubscription> for SubscriptionDto {
    fn from(sub: &MwiSubscription) -> Self {
        SubscriptionDto {
            id: sub.id,
            aor: sub.aor.clone(),
            contact: sub.contact.clone(),
            expires_at: sub.expires_at,
            expires_in: sub.time_until_expiry().max(0),
            last_notified_at: sub.last_notified_at,
        }
    }
}

/// MWI status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MwiStatusDto {
    pub enabled: bool,
    pub mailboxes: Vec<MailboxDto>,
    pub subscriptions: Vec<SubscriptionDto>,
}

impl MwiStatusDto {
    /// `None` manager means MWI is switched off
    pub fn from_manager(manager: Option<&MwiManager>) -> Self {
        match manager {
            Some(manager) => {
                let snapshot = manager.snapshot();
                MwiStatusDto {
                    enabled: true,
                    mailboxes: snapshot.mailboxes.iter().map(MailboxDto::from).collect(),
                    subscriptions: snapshot.subscriptions.iter().map(SubscriptionDto::from).collect(),
                }
            }
            None => MwiStatusDto {
                enabled: false,
                mailboxes: Vec::new(),
                subscriptions: Vec::new(),
            },
        }
    }
}
