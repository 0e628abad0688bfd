//! SIP Registrar - manages device registrations

use crate::config::RegistrarConfig;
use crate::domain::registration::{
    InMemoryRegistrationStore, Registration, RegistrationStore, Transport,
};
use crate::domain::shared::{DomainError, Result};
use chrono::Utc;
use parking_lot::RwLock;
use rsip::Header;
use std::sync::Arc;
use tracing::{debug, info};

/// Registrar over an injectable binding store.
///
/// Expiry is evaluated at read time, so counts and lookups stay correct no
/// matter how often [`Registrar::reap_expired`] runs.
pub struct Registrar {
    store: Arc<dyn RegistrationStore>,
    config: RwLock<RegistrarConfig>,
}

impl Registrar {
    pub fn new(config: RegistrarConfig, store: Arc<dyn RegistrationStore>) -> Self {
        Self {
            store,
            config: RwLock::new(config),
        }
    }

    pub fn in_memory(config: RegistrarConfig) -> Self {
        Self::new(config, Arc::new(InMemoryRegistrationStore::new()))
    }

    pub fn reload(&self, config: RegistrarConfig) {
        *self.config.write() = config;
    }

    pub fn config(&self) -> RegistrarConfig {
        self.config.read().clone()
    }

    /// Effective expiration for a REGISTER request
    fn get_expires(&self, requested: Option<u32>) -> u32 {
        let config = self.config.read();
        match requested {
            Some(0) => 0,
            Some(expires) => expires.clamp(config.min_expires, config.max_expires),
            None => config.default_expires,
        }
    }

    /// Insert or refresh a UDP binding that expires exactly `ttl` seconds
    /// from now; ttl 0 removes it
    pub fn register(&self, device_id: &str, contact: &str, ttl: u32) -> Result<Option<Registration>> {
        self.bind(device_id, contact, Transport::Udp, ttl, None)
    }

    /// Insert or refresh a binding with the requested ttl clamped to the
    /// configured bounds; `None` means the configured default
    pub fn register_binding(
        &self,
        device_id: &str,
        contact: &str,
        transport: Transport,
        ttl: Option<u32>,
        user_agent: Option<String>,
    ) -> Result<Option<Registration>> {
        let expires = self.get_expires(ttl);
        self.bind(device_id, contact, transport, expires, user_agent)
    }

    fn bind(
        &self,
        device_id: &str,
        contact: &str,
        transport: Transport,
        expires: u32,
        user_agent: Option<String>,
    ) -> Result<Option<Registration>> {
        if device_id.trim().is_empty() || contact.trim().is_empty() {
            return Err(DomainError::ValidationError(
                "Registration needs a device id and a contact".to_string(),
            ));
        }

        if expires == 0 {
            self.unregister(device_id);
            return Ok(None);
        }

        let registration = self.store.upsert(device_id, &mut |existing| match existing {
            Some(mut reg) if !reg.is_expired() => {
                reg.refresh(contact.to_string(), transport, expires);
                if user_agent.is_some() {
                    reg.user_agent = user_agent.clone();
                }
                reg
            }
            _ => Registration::new(device_id.to_string(), contact.to_string(), transport, expires)
                .with_user_agent(user_agent.clone()),
        });

        info!(
            "Registered: {} -> {} via {} (expires in {}s)",
            device_id, contact, transport, expires
        );
        Ok(Some(registration))
    }

    /// Apply a REGISTER request received over `transport`
    pub fn register_request(
        &self,
        request: &rsip::Request,
        transport: Transport,
    ) -> Result<Option<Registration>> {
        let device_id = Self::extract_aor(request).ok_or_else(|| {
            DomainError::ValidationError("REGISTER without a To URI".to_string())
        })?;
        let (contact, contact_expires) = Self::extract_contact(request).ok_or_else(|| {
            DomainError::ValidationError("REGISTER without a Contact".to_string())
        })?;

        if contact == "*" {
            self.unregister(&device_id);
            return Ok(None);
        }

        // Contact parameter wins over the Expires header (RFC 3261 §10.3)
        let requested = contact_expires.or_else(|| Self::extract_expires(request));
        self.register_binding(
            &device_id,
            &contact,
            transport,
            requested,
            Self::extract_user_agent(request),
        )
    }

    pub fn unregister(&self, device_id: &str) -> bool {
        let removed = self.store.remove(device_id).is_some();
        if removed {
            info!("Unregistered: {}", device_id);
        }
        removed
    }

    /// True only for a binding that has not expired yet
    pub fn is_registered(&self, device_id: &str) -> bool {
        self.get(device_id).is_some()
    }

    pub fn get(&self, device_id: &str) -> Option<Registration> {
        self.store.get(device_id).filter(|r| !r.is_expired())
    }

    /// Number of currently valid bindings
    pub fn get_registration_count(&self) -> usize {
        let now = Utc::now();
        self.store
            .list()
            .iter()
            .filter(|r| !r.is_expired_at(now))
            .count()
    }

    pub fn list_active(&self) -> Vec<Registration> {
        let now = Utc::now();
        let mut active: Vec<_> = self
            .store
            .list()
            .into_iter()
            .filter(|r| !r.is_expired_at(now))
            .collect();
        active.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        active
    }

    /// Physically remove expired bindings
    pub fn reap_expired(&self) -> usize {
        let now = Utc::now();
        let removed = self.store.retain(&mut |r| !r.is_expired_at(now));
        if removed > 0 {
            debug!("Reaped {} expired registrations", removed);
        }
        removed
    }

    fn header_text(header: &Header) -> String {
        let raw = header.to_string();
        match raw.split_once(':') {
            Some((name, value)) if !name.contains('<') && !name.contains(' ') => {
                value.trim().to_string()
            }
            _ => raw.trim().to_string(),
        }
    }

    /// URI inside `<...>`, or up to the first parameter
    fn uri_of(value: &str) -> String {
        if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
            if start < end {
                return value[start + 1..end].trim().to_string();
            }
        }
        value.split(';').next().unwrap_or(value).trim().to_string()
    }

    /// Extract AoR from the To header
    fn extract_aor(request: &rsip::Request) -> Option<String> {
        request.headers.iter().find_map(|h| match h {
            Header::To(_) => Some(Self::uri_of(&Self::header_text(h))),
            _ => None,
        })
    }

    /// Contact URI and its `expires` parameter, if any
    fn extract_contact(request: &rsip::Request) -> Option<(String, Option<u32>)> {
        request.headers.iter().find_map(|h| match h {
            Header::Contact(_) => {
                let value = Self::header_text(h);
                if value.trim() == "*" {
                    return Some(("*".to_string(), None));
                }
                let params = match value.find('>') {
                    Some(end) => &value[end + 1..],
                    None => value.split_once(';').map(|(_, p)| p).unwrap_or(""),
                };
                let expires = params
                    .split(';')
                    .filter_map(|p| p.trim().split_once('='))
                    .find(|(k, _)| k.eq_ignore_ascii_case("expires"))
                    .and_then(|(_, v)| v.trim().parse().ok());
                Some((Self::uri_of(&value), expires))
            }
            _ => None,
        })
    }

    fn extract_expires(request: &rsip::Request) -> Option<u32> {
        request.headers.iter().find_map(|h| match h {
            Header::Expires(_) => Self::header_text(h).parse().ok(),
            _ => None,
        })
    }

    fn extract_user_agent(request: &rsip::Request) -> Option<String> {
        request.headers.iter().find_map(|h| match h {
            Header::UserAgent(_) => Some(Self::header_text(h)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registrar() -> Registrar {
        Registrar::in_memory(RegistrarConfig::default())
    }

    fn register_request(contact: &str, expires: Option<u32>) -> rsip::Request {
        let mut text = String::from(
            "REGISTER sip:pbx.local SIP/2.0\r\n\
             Via: SIP/2.0/UDP 192.168.1.100:5060;branch=z9hG4bK776asdhds\r\n\
             Max-Forwards: 70\r\n\
             To: <sip:alice@pbx.local>\r\n\
             From: <sip:alice@pbx.local>;tag=1928301774\r\n\
             Call-ID: a84b4c76e66710@pc33.pbx.local\r\n\
             CSeq: 1 REGISTER\r\n\
             User-Agent: Softphone/2.1\r\n",
        );
        text.push_str(&format!("Contact: {}\r\n", contact));
        if let Some(expires) = expires {
            text.push_str(&format!("Expires: {}\r\n", expires));
        }
        text.push_str("Content-Length: 0\r\n\r\n");
        rsip::Request::try_from(text.as_bytes()).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let registrar = registrar();
        let reg = registrar
            .register("1001", "sip:1001@192.168.1.100:5060", 3600)
            .unwrap()
            .unwrap();
        assert_eq!(reg.transport, Transport::Udp);
        assert!(registrar.is_registered("1001"));
        assert!(!registrar.is_registered("1002"));
        assert_eq!(registrar.get_registration_count(), 1);
    }

    #[test]
    fn test_requested_ttl_is_clamped() {
        let registrar = registrar();
        let short = registrar
            .register_binding("1001", "sip:a", Transport::Udp, Some(5), None)
            .unwrap()
            .unwrap();
        assert!(short.seconds_remaining() >= 59);

        let long = registrar
            .register_binding("1002", "sip:b", Transport::Udp, Some(1_000_000), None)
            .unwrap()
            .unwrap();
        assert!(long.seconds_remaining() <= 7200);
    }

    #[test]
    fn test_direct_ttl_is_exact() {
        let registrar = registrar();
        let reg = registrar.register("1001", "sip:a", 5).unwrap().unwrap();
        assert_eq!((reg.expires_at - reg.registered_at).num_seconds(), 5);
        assert!(reg.seconds_remaining() <= 5);

        let long = registrar.register("1002", "sip:b", 100_000).unwrap().unwrap();
        assert!(long.seconds_remaining() > 7200);
    }

    #[test]
    fn test_short_ttl_lapses() {
        let registrar = registrar();
        registrar.register("1001", "sip:a", 1).unwrap();
        assert!(registrar.is_registered("1001"));

        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(!registrar.is_registered("1001"));
        assert_eq!(registrar.get_registration_count(), 0);
        assert_eq!(registrar.reap_expired(), 1);
    }

    #[test]
    fn test_zero_ttl_unregisters() {
        let registrar = registrar();
        registrar.register("1001", "sip:a", 600).unwrap();
        assert!(registrar.register("1001", "sip:a", 0).unwrap().is_none());
        assert!(!registrar.is_registered("1001"));
        assert!(!registrar.unregister("1001"));
    }

    #[test]
    fn test_refresh_keeps_registered_at() {
        let registrar = registrar();
        let first = registrar.register("1001", "sip:a", 600).unwrap().unwrap();
        let second = registrar
            .register_binding("1001", "sip:b", Transport::Tls, Some(900), Some("Phone/1".into()))
            .unwrap()
            .unwrap();
        assert_eq!(first.registered_at, second.registered_at);
        assert_eq!(second.contact, "sip:b");
        assert_eq!(second.transport, Transport::Tls);
        assert_eq!(second.user_agent.as_deref(), Some("Phone/1"));
        assert_eq!(registrar.list_active().len(), 1);
    }

    #[test]
    fn test_empty_identity_rejected() {
        let registrar = registrar();
        assert!(matches!(
            registrar.register("", "sip:a", 60),
            Err(DomainError::ValidationError(_))
        ));
    }

    #[test]
    fn test_register_request() {
        let registrar = registrar();
        let reg = registrar
            .register_request(
                &register_request("<sip:alice@192.168.1.100:5060>", Some(1800)),
                Transport::Udp,
            )
            .unwrap()
            .unwrap();
        assert_eq!(reg.device_id, "sip:alice@pbx.local");
        assert_eq!(reg.contact, "sip:alice@192.168.1.100:5060");
        assert!(reg.seconds_remaining() > 1700);
        assert!(reg.user_agent.is_some());

        // expires param on the Contact overrides the header
        let removed = registrar
            .register_request(
                &register_request("<sip:alice@192.168.1.100:5060>;expires=0", Some(1800)),
                Transport::Udp,
            )
            .unwrap();
        assert!(removed.is_none());
        assert_eq!(registrar.get_registration_count(), 0);
    }
}
