//! Narrow ports onto the voicemail persistence layer and the alert dispatcher

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Unread/read message counts for one mailbox
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxCounts {
    pub new_messages: u32,
    pub old_messages: u32,
    pub new_urgent: u32,
    pub old_urgent: u32,
}

/// Read-side of voicemail storage used to drive MWI
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VoicemailCounter: Send + Sync {
    async fn mailbox_counts(&self, aor: &str) -> Result<MailboxCounts, String>;
}

/// Alert kinds handed to the outbound notification service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Alert {
    Voicemail { aor: String, new_messages: u32 },
    Sms { aor: String, from: String, body: String },
}

/// Fire-and-forget delivery of voicemail/SMS alerts (email, push, ...)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationDispatcher: Send + Sync {
    async fn dispatch(&self, alert: Alert) -> Result<(), String>;
}
