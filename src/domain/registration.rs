//! Device registrations (SIP bindings)

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Transport a binding was learned over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Udp,
    Tcp,
    Tls,
    Ws,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
            Transport::Ws => "ws",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Transport::Udp),
            "tcp" => Ok(Transport::Tcp),
            "tls" => Ok(Transport::Tls),
            "ws" | "wss" => Ok(Transport::Ws),
            other => Err(format!("Unknown transport: {}", other)),
        }
    }
}

/// Registration binding for a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub device_id: String,
    pub contact: String,
    pub transport: Transport,
    pub user_agent: Option<String>,
    pub registered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Registration {
    pub fn new(device_id: String, contact: String, transport: Transport, ttl_seconds: u32) -> Self {
        let now = Utc::now();
        Self {
            device_id,
            contact,
            transport,
            user_agent: None,
            registered_at: now,
            expires_at: now + Duration::seconds(ttl_seconds as i64),
            last_seen: now,
        }
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Expired bindings are logically absent even before the reaper runs
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn refresh(&mut self, contact: String, transport: Transport, ttl_seconds: u32) {
        let now = Utc::now();
        self.contact = contact;
        self.transport = transport;
        self.expires_at = now + Duration::seconds(ttl_seconds as i64);
        self.last_seen = now;
    }

    pub fn seconds_remaining(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds().max(0)
    }
}

/// Storage port for registrations keyed by device id
pub trait RegistrationStore: Send + Sync {
    /// Insert or refresh; `merge` receives the existing binding if there is one
    fn upsert(
        &self,
        device_id: &str,
        merge: &mut dyn FnMut(Option<Registration>) -> Registration,
    ) -> Registration;

    fn get(&self, device_id: &str) -> Option<Registration>;

    fn list(&self) -> Vec<Registration>;

    fn remove(&self, device_id: &str) -> Option<Registration>;

    fn retain(&self, keep: &mut dyn FnMut(&Registration) -> bool) -> usize;
}

#[derive(Default)]
pub struct InMemoryRegistrationStore {
    bindings: RwLock<HashMap<String, Registration>>,
}

impl InMemoryRegistrationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistrationStore for InMemoryRegistrationStore {
    fn upsert(
        &self,
        device_id: &str,
        merge: &mut dyn FnMut(Option<Registration>) -> Registration,
    ) -> Registration {
        let mut bindings = self.bindings.write();
        let merged = merge(bindings.get(device_id).cloned());
        bindings.insert(device_id.to_string(), merged.clone());
        merged
    }

    fn get(&self, device_id: &str) -> Option<Registration> {
        self.bindings.read().get(device_id).cloned()
    }

    fn list(&self) -> Vec<Registration> {
        self.bindings.read().values().cloned().collect()
    }

    fn remove(&self, device_id: &str) -> Option<Registration> {
        self.bindings.write().remove(device_id)
    }

    fn retain(&self, keep: &mut dyn FnMut(&Registration) -> bool) -> usize {
        let mut bindings = self.bindings.write();
        let before = bindings.len();
        bindings.retain(|_, reg| keep(reg));
        before - bindings.len()
    }
}
