/// Certificate and private key loading
use crate::domain::shared::{DomainError, Result};
use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::BufReader;
use std::path::Path;
use x509_parser::extensions::GeneralName;

fn tls_error(message: impl Into<String>) -> DomainError {
    DomainError::Tls(message.into())
}

/// Parsed facts about the leaf certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateInfo {
    pub subject: String,
    pub issuer: String,
    pub serial_number: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// SHA-256 over the DER, `AA:BB:...`
    pub fingerprint_sha256: String,
    pub san_dns_names: Vec<String>,
}

impl CertificateInfo {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = x509_parser::parse_x509_certificate(der)
            .map_err(|e| tls_error(format!("Invalid X.509 certificate: {}", e)))?;

        let timestamp = |secs: i64| {
            Utc.timestamp_opt(secs, 0)
                .single()
                .ok_or_else(|| tls_error(format!("Certificate time out of range: {}", secs)))
        };

        let san_dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        };

        Ok(Self {
            subject: cert.subject().to_string(),
            issuer: cert.issuer().to_string(),
            serial_number: cert.raw_serial_as_string(),
            not_before: timestamp(cert.validity().not_before.timestamp())?,
            not_after: timestamp(cert.validity().not_after.timestamp())?,
            fingerprint_sha256: fingerprint(der),
            san_dns_names,
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_before && now <= self.not_after
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    pub fn is_self_signed(&self) -> bool {
        self.subject == self.issuer
    }

    pub fn days_until_expiration(&self) -> i64 {
        (self.not_after - Utc::now()).num_days()
    }

    pub fn is_expiring_within(&self, days: i64) -> bool {
        self.not_after - Utc::now() < chrono::Duration::days(days)
    }

    /// Whether a SAN entry (wildcards included) covers `domain`
    pub fn covers(&self, domain: &str) -> bool {
        let domain = domain.to_ascii_lowercase();
        self.san_dns_names.iter().any(|san| {
            let san = san.to_ascii_lowercase();
            match san.strip_prefix("*.") {
                Some(suffix) => domain
                    .split_once('.')
                    .map(|(_, rest)| rest == suffix)
                    .unwrap_or(false),
                None => san == domain,
            }
        })
    }
}

/// Fingerprint in the colon-separated form used by SDP and trunk configuration
pub fn fingerprint(der: &[u8]) -> String {
    Sha256::digest(der)
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Certificate chain, key and the leaf's parsed details
#[derive(Debug)]
pub struct LoadedCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub info: CertificateInfo,
}

pub fn load_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_error(format!("Unreadable certificate PEM: {}", e)))?;

    if certs.is_empty() {
        return Err(tls_error("No certificates found in PEM data"));
    }
    Ok(certs)
}

pub fn load_private_key(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| tls_error(format!("Unreadable private key PEM: {}", e)))?
        .ok_or_else(|| tls_error("No private key found in PEM data"))
}

impl LoadedCertificate {
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        let chain = load_certs(cert_pem)?;
        let key = load_private_key(key_pem)?;
        let info = CertificateInfo::from_der(chain[0].as_ref())?;
        Ok(Self { chain, key, info })
    }

    pub fn from_files(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let read = |path: &Path| {
            std::fs::read(path)
                .map_err(|e| tls_error(format!("Failed to read {}: {}", path.display(), e)))
        };
        Self::from_pem(&read(cert_path)?, &read(key_path)?)
    }
}

/// Trust anchors from a CA bundle file
pub fn load_ca_bundle(path: &Path) -> Result<Vec<CertificateInfo>> {
    let pem = std::fs::read(path)
        .map_err(|e| tls_error(format!("Failed to read {}: {}", path.display(), e)))?;
    load_certs(&pem)?
        .iter()
        .map(|der| CertificateInfo::from_der(der.as_ref()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(names: &[&str]) -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(
            names.iter().map(|n| n.to_string()).collect::<Vec<_>>(),
        )
        .unwrap();
        (
            cert.serialize_pem().unwrap(),
            cert.serialize_private_key_pem(),
        )
    }

    #[test]
    fn test_load_pem_and_parse() {
        let (cert_pem, key_pem) = self_signed(&["pbx.example.com", "*.sip.example.com"]);
        let loaded = LoadedCertificate::from_pem(cert_pem.as_bytes(), key_pem.as_bytes()).unwrap();

        assert_eq!(loaded.chain.len(), 1);
        assert!(loaded.info.is_valid());
        assert!(loaded.info.is_self_signed());
        assert!(loaded.info.covers("pbx.example.com"));
        assert!(loaded.info.covers("edge.sip.example.com"));
        assert!(!loaded.info.covers("other.example.com"));
        assert_eq!(loaded.info.fingerprint_sha256.len(), 32 * 3 - 1);
    }

    #[test]
    fn test_missing_key_rejected() {
        let (cert_pem, _) = self_signed(&["pbx.example.com"]);
        let err = LoadedCertificate::from_pem(cert_pem.as_bytes(), b"").unwrap_err();
        assert!(matches!(err, DomainError::Tls(_)));

        assert!(load_certs(b"not a pem").is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint(b"abc");
        assert!(fp.starts_with("BA:78:16:BF"));
    }
}
