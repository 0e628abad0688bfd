/// Hot-swappable server certificate
use super::certificate::LoadedCertificate;
use crate::domain::shared::{DomainError, Result};
use parking_lot::RwLock;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::fmt;
use std::sync::Arc;

/// Certificate resolver shared by every acceptor built from the same manager.
///
/// Handshakes pick up whatever key is installed when they start; sessions
/// already established keep the key they negotiated with.
#[derive(Default)]
pub struct SwappableCertResolver {
    current: RwLock<Option<Arc<CertifiedKey>>>,
}

impl SwappableCertResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the served certificate
    pub fn install(&self, loaded: &LoadedCertificate) -> Result<()> {
        let signing_key = rustls::crypto::ring::sign::any_supported_type(&loaded.key)
            .map_err(|e| DomainError::Tls(format!("Unsupported private key: {}", e)))?;
        let certified = CertifiedKey::new(loaded.chain.clone(), signing_key);
        *self.current.write() = Some(Arc::new(certified));
        Ok(())
    }

    pub fn clear(&self) {
        *self.current.write() = None;
    }

    pub fn has_certificate(&self) -> bool {
        self.current.read().is_some()
    }

    /// Leaf DER of the installed certificate
    pub fn leaf_der(&self) -> Option<Vec<u8>> {
        self.current
            .read()
            .as_ref()
            .and_then(|key| key.cert.first().map(|c| c.as_ref().to_vec()))
    }
}

impl fmt::Debug for SwappableCertResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwappableCertResolver")
            .field("installed", &self.has_certificate())
            .finish()
    }
}

impl ResolvesServerCert for SwappableCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current.read().clone()
    }
}
