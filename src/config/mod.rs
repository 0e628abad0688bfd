//! Configuration management
//!
//! Layered load: built-in defaults, then an optional TOML file, then
//! `PBX__SECTION__KEY` environment variables.

use crate::domain::shared::{DomainError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PbxConfig {
    pub sip: SipConfig,
    pub registrar: RegistrarConfig,
    pub calls: CallsConfig,
    pub hold: HoldConfig,
    pub transfer: TransferConfig,
    pub moh: MohConfig,
    pub mwi: MwiConfig,
    pub zrtp: ZrtpConfig,
    pub tls: TlsConfig,
    pub srtp: SrtpConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl PbxConfig {
    /// Load defaults, the optional file and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&PbxConfig::default())
            .map_err(|e| DomainError::ValidationError(format!("Default config: {}", e)))?;

        let mut builder = config::Config::builder().add_source(defaults);
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("PBX")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: PbxConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| DomainError::ValidationError(format!("Config load failed: {}", e)))?;

        loaded.validate()?;
        Ok(loaded)
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(source: &str) -> Result<Self> {
        let parsed: PbxConfig = toml::from_str(source)
            .map_err(|e| DomainError::ValidationError(format!("Invalid TOML: {}", e)))?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Render the effective configuration
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| DomainError::Internal(format!("Config render failed: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        self.registrar.validate()?;
        self.mwi.validate()?;
        self.zrtp.validate()?;
        self.tls.validate()?;
        self.srtp.validate()?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> DomainError {
    DomainError::ValidationError(message.into())
}

fn check_expires_range(section: &str, min: u32, default: u32, max: u32) -> Result<()> {
    if min == 0 || min > max {
        return Err(invalid(format!(
            "{}: min_expires ({}) must be > 0 and <= max_expires ({})",
            section, min, max
        )));
    }
    if default < min || default > max {
        return Err(invalid(format!(
            "{}: default_expires ({}) outside [{}, {}]",
            section, default, min, max
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SipConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub domain: String,
    pub user_agent: String,
    /// Final-response wait for in-dialog requests
    pub request_timeout_ms: u64,
}

impl Default for SipConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            bind_port: 5060,
            domain: "localhost".to_string(),
            user_agent: "pbx-core".to_string(),
            request_timeout_ms: 4000,
        }
    }
}

impl SipConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    pub enabled: bool,
    pub default_expires: u32,
    pub min_expires: u32,
    pub max_expires: u32,
    pub reap_interval_secs: u64,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_expires: 3600,
            min_expires: 60,
            max_expires: 7200,
            reap_interval_secs: 30,
        }
    }
}

impl RegistrarConfig {
    fn validate(&self) -> Result<()> {
        check_expires_range("registrar", self.min_expires, self.default_expires, self.max_expires)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallsConfig {
    /// How long terminated sessions stay visible before reaping
    pub terminated_grace_secs: u64,
    pub reap_interval_secs: u64,
}

impl Default for CallsConfig {
    fn default() -> Self {
        Self {
            terminated_grace_secs: 300,
            reap_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HoldConfig {
    pub enabled: bool,
    pub signaling_timeout_secs: u64,
}

impl Default for HoldConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signaling_timeout_secs: 5,
        }
    }
}

impl HoldConfig {
    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_secs(self.signaling_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    pub enabled: bool,
    pub signaling_timeout_secs: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            signaling_timeout_secs: 10,
        }
    }
}

impl TransferConfig {
    pub fn signaling_timeout(&self) -> Duration {
        Duration::from_secs(self.signaling_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MohConfig {
    pub enabled: bool,
    /// Hold-audio WAV file
    pub audio_path: Option<PathBuf>,
    /// Play a 440 Hz tone when no asset is loaded
    pub tone_fallback: bool,
}

impl Default for MohConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audio_path: None,
            tone_fallback: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MwiConfig {
    pub enabled: bool,
    pub default_expires: u32,
    pub min_expires: u32,
    pub max_expires: u32,
    pub notify_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for MwiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_expires: 3600,
            min_expires: 60,
            max_expires: 7200,
            notify_timeout_secs: 5,
            cleanup_interval_secs: 60,
        }
    }
}

impl MwiConfig {
    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        check_expires_range("mwi", self.min_expires, self.default_expires, self.max_expires)
    }
}

pub const ZRTP_CACHE_TTL_MIN_DAYS: u32 = 1;
pub const ZRTP_CACHE_TTL_MAX_DAYS: u32 = 365;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZrtpConfig {
    pub enabled: bool,
    pub cache_ttl_days: u32,
    /// JSON file holding the local ZID and retained secrets
    pub cache_path: Option<PathBuf>,
    pub negotiation_timeout_secs: u64,
    pub maintenance_interval_secs: u64,
}

impl Default for ZrtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cache_ttl_days: 90,
            cache_path: None,
            negotiation_timeout_secs: 30,
            maintenance_interval_secs: 60,
        }
    }
}

impl ZrtpConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn cache_ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.cache_ttl_days as i64)
    }

    fn validate(&self) -> Result<()> {
        if !(ZRTP_CACHE_TTL_MIN_DAYS..=ZRTP_CACHE_TTL_MAX_DAYS).contains(&self.cache_ttl_days) {
            return Err(invalid(format!(
                "zrtp.cache_ttl_days must be within {}-{}, got {}",
                ZRTP_CACHE_TTL_MIN_DAYS, ZRTP_CACHE_TTL_MAX_DAYS, self.cache_ttl_days
            )));
        }
        Ok(())
    }
}

/// Certificate lifecycle mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertMode {
    /// Administrator-supplied files, refreshed only by explicit reload
    Manual,
    /// Challenge-based issuance and renewal
    Automatic,
}

impl CertMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertMode::Manual => "manual",
            CertMode::Automatic => "automatic",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeType {
    Http01,
    Dns01,
}

/// TLS configuration for SIP signaling
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub mode: CertMode,

    /// Path to certificate chain (PEM format)
    pub certificate_path: Option<PathBuf>,

    /// Path to private key (PEM format)
    pub private_key_path: Option<PathBuf>,

    /// Optional CA bundle appended to the served chain
    pub ca_bundle_path: Option<PathBuf>,

    /// Minimum TLS version ("1.2" or "1.3")
    pub min_version: String,

    /// Names requested in automatic mode
    pub domains: Vec<String>,
    pub contact_email: Option<String>,
    pub challenge: ChallengeType,
    pub dns_provider: Option<String>,
    pub dns_provider_token: Option<String>,

    pub renew_before_days: u32,
    pub check_interval_secs: u64,
    pub issuer_timeout_secs: u64,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: CertMode::Manual,
            certificate_path: None,
            private_key_path: None,
            ca_bundle_path: None,
            min_version: "1.2".to_string(),
            domains: Vec::new(),
            contact_email: None,
            challenge: ChallengeType::Http01,
            dns_provider: None,
            dns_provider_token: None,
            renew_before_days: 30,
            check_interval_secs: 3600,
            issuer_timeout_secs: 120,
        }
    }
}

impl TlsConfig {
    /// Manual-mode config pointing at existing files
    pub fn manual(cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            enabled: true,
            certificate_path: Some(cert_path),
            private_key_path: Some(key_path),
            ..Default::default()
        }
    }

    /// Automatic-mode config; issued files are written to the given paths
    pub fn automatic(domains: Vec<String>, cert_path: PathBuf, key_path: PathBuf) -> Self {
        Self {
            enabled: true,
            mode: CertMode::Automatic,
            certificate_path: Some(cert_path),
            private_key_path: Some(key_path),
            domains,
            ..Default::default()
        }
    }

    /// Set CA bundle path
    pub fn with_ca_bundle(mut self, ca_path: PathBuf) -> Self {
        self.ca_bundle_path = Some(ca_path);
        self
    }

    pub fn with_dns_challenge(mut self, provider: &str, token: &str) -> Self {
        self.challenge = ChallengeType::Dns01;
        self.dns_provider = Some(provider.to_string());
        self.dns_provider_token = Some(token.to_string());
        self
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn issuer_timeout(&self) -> Duration {
        Duration::from_secs(self.issuer_timeout_secs)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.certificate_path.is_none() {
            return Err(invalid("tls.certificate_path required when TLS is enabled"));
        }
        if self.private_key_path.is_none() {
            return Err(invalid("tls.private_key_path required when TLS is enabled"));
        }

        if !["1.2", "1.3"].contains(&self.min_version.as_str()) {
            return Err(invalid(format!("Invalid TLS version: {}", self.min_version)));
        }

        if self.mode == CertMode::Automatic {
            if self.domains.is_empty() {
                return Err(invalid("tls.domains required in automatic mode"));
            }
            if self.challenge == ChallengeType::Dns01
                && (self.dns_provider.is_none() || self.dns_provider_token.is_none())
            {
                return Err(invalid(
                    "DNS challenge requires tls.dns_provider and tls.dns_provider_token",
                ));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrtpConfig {
    pub enabled: bool,
    /// Reject calls whose offer carries no acceptable crypto
    pub require_srtp: bool,
    /// Allowed profiles in preference order
    pub profiles: Vec<String>,
}

impl Default for SrtpConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            require_srtp: false,
            profiles: vec![
                "AEAD_AES_256_GCM".to_string(),
                "AEAD_AES_128_GCM".to_string(),
                "AES_CM_128_HMAC_SHA1_80".to_string(),
                "AES_CM_128_HMAC_SHA1_32".to_string(),
            ],
        }
    }
}

impl SrtpConfig {
    fn validate(&self) -> Result<()> {
        if self.enabled && self.profiles.is_empty() {
            return Err(invalid("srtp.profiles must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive, overridden by RUST_LOG
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub listen: String,
    pub update_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: "0.0.0.0:9090".to_string(),
            update_interval_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = PbxConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.zrtp.cache_ttl_days, 90);
        assert_eq!(config.tls.mode, CertMode::Manual);
        assert!(!config.tls.enabled);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = PbxConfig::from_toml(
            r#"
            [sip]
            domain = "pbx.example.com"

            [mwi]
            enabled = false
            "#,
        )
        .unwrap();

        assert_eq!(config.sip.domain, "pbx.example.com");
        assert_eq!(config.sip.bind_port, 5060);
        assert!(!config.mwi.enabled);
        assert!(config.registrar.enabled);
    }

    #[test]
    fn test_zrtp_ttl_bounds() {
        let mut config = PbxConfig::default();
        config.zrtp.cache_ttl_days = 0;
        assert!(config.validate().is_err());
        config.zrtp.cache_ttl_days = 366;
        assert!(config.validate().is_err());
        config.zrtp.cache_ttl_days = 365;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tls_validation() {
        let manual = TlsConfig {
            enabled: true,
            ..Default::default()
        };
        assert!(manual.validate().is_err());

        let auto = TlsConfig::automatic(
            vec!["pbx.example.com".to_string()],
            PathBuf::from("/tmp/cert.pem"),
            PathBuf::from("/tmp/key.pem"),
        );
        assert!(auto.validate().is_ok());

        let mut dns = auto.clone();
        dns.challenge = ChallengeType::Dns01;
        assert!(dns.validate().is_err());
        assert!(auto.with_dns_challenge("cloudflare", "tok").validate().is_ok());
    }

    #[test]
    fn test_render_round_trip() {
        let config = PbxConfig::default();
        let rendered = config.to_toml().unwrap();
        assert_eq!(PbxConfig::from_toml(&rendered).unwrap(), config);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pbx.toml");
        std::fs::write(&path, "[registrar]\nmax_expires = 3600\n").unwrap();

        let config = PbxConfig::load(Some(&path)).unwrap();
        assert_eq!(config.registrar.max_expires, 3600);
        assert_eq!(config.registrar.default_expires, 3600);
    }
}
