//! Certificate lifecycle for SIP over TLS
//!
//! Manual mode serves administrator-supplied files and changes them only on
//! [`CertificateManager::reload`]. Automatic mode asks a [`CertificateIssuer`]
//! for a fresh certificate when the current one nears expiry, writes it to
//! the configured paths and swaps it in.

use super::certificate::{load_certs, CertificateInfo, LoadedCertificate};
use super::config::build_acceptor;
use super::resolver::SwappableCertResolver;
use crate::config::{CertMode, ChallengeType, TlsConfig};
use crate::domain::shared::{DomainError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const TRUNK_PUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// How the issuer proves control of the requested names
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Challenge {
    Http01,
    Dns01 { provider: String, token: String },
}

/// PEM output of a successful issuance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub certificate_pem: String,
    pub private_key_pem: String,
}

/// Challenge-based certificate authority client (ACME or similar)
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CertificateIssuer: Send + Sync {
    async fn issue(
        &self,
        domains: Vec<String>,
        contact_email: Option<String>,
        challenge: Challenge,
    ) -> std::result::Result<IssuedCertificate, String>;
}

/// Carrier gateway side of trunk TLS
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TrunkTlsClient: Send + Sync {
    async fn update_certificate(
        &self,
        fingerprint: String,
        not_after: DateTime<Utc>,
    ) -> std::result::Result<(), String>;
}

/// Snapshot returned by [`CertificateManager::status`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CertStatus {
    pub mode: CertMode,
    pub domains: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub issuer: Option<String>,
    pub subject: Option<String>,
    pub fingerprint: Option<String>,
    pub valid: bool,
    pub days_remaining: Option<i64>,
    pub last_renewal: Option<DateTime<Utc>>,
    pub next_renewal: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct LifecycleState {
    current: Option<CertificateInfo>,
    last_renewal: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct CertificateManager {
    config: RwLock<TlsConfig>,
    resolver: Arc<SwappableCertResolver>,
    state: RwLock<LifecycleState>,
    issuer: Option<Arc<dyn CertificateIssuer>>,
    trunk: Option<Arc<dyn TrunkTlsClient>>,
    renewal: tokio::sync::Mutex<()>,
}

impl CertificateManager {
    pub fn new(config: TlsConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config: RwLock::new(config),
            resolver: Arc::new(SwappableCertResolver::new()),
            state: RwLock::new(LifecycleState::default()),
            issuer: None,
            trunk: None,
            renewal: tokio::sync::Mutex::new(()),
        })
    }

    pub fn with_issuer(mut self, issuer: Arc<dyn CertificateIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn with_trunk_client(mut self, trunk: Arc<dyn TrunkTlsClient>) -> Self {
        self.trunk = Some(trunk);
        self
    }

    pub fn mode(&self) -> CertMode {
        self.config.read().mode
    }

    pub fn config(&self) -> TlsConfig {
        self.config.read().clone()
    }

    pub fn resolver(&self) -> Arc<SwappableCertResolver> {
        self.resolver.clone()
    }

    /// Acceptor bound to the swappable resolver; later swaps apply to it too
    pub fn acceptor(&self) -> Result<TlsAcceptor> {
        let min_version = self.config.read().min_version.clone();
        build_acceptor(self.resolver.clone(), &min_version)
    }

    pub fn current(&self) -> Option<CertificateInfo> {
        self.state.read().current.clone()
    }

    /// Load whatever is on disk at startup.
    ///
    /// Missing files are fatal only in manual mode; automatic mode issues a
    /// certificate on the first renewal check instead.
    pub async fn initialize(&self) -> Result<()> {
        match self.mode() {
            CertMode::Manual => self.reload().await.map(|_| ()),
            CertMode::Automatic => {
                if let Err(e) = self.reload().await {
                    info!("No usable certificate on disk yet ({}), will issue", e);
                }
                Ok(())
            }
        }
    }

    /// Re-read certificate, key and CA bundle from disk and swap them in.
    ///
    /// On failure the previously installed certificate keeps serving.
    pub async fn reload(&self) -> Result<CertStatus> {
        let config = self.config();
        let loaded = match Self::load_from_disk(&config) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.state.write().last_error = Some(e.to_string());
                return Err(e);
            }
        };

        self.install(loaded)?;
        info!("TLS certificate reloaded from disk");
        self.push_to_trunk().await;
        Ok(self.status())
    }

    /// Apply a new `[tls]` section
    pub fn reload_config(&self, config: TlsConfig) -> Result<()> {
        config.validate()?;
        *self.config.write() = config;
        Ok(())
    }

    /// Out-of-band renewal; automatic mode only
    pub async fn force_renewal(&self) -> Result<CertStatus> {
        if self.mode() == CertMode::Manual {
            return Err(DomainError::ModeMismatch {
                mode: CertMode::Manual.as_str().to_string(),
                operation: "force_renewal".to_string(),
            });
        }
        self.renew().await?;
        Ok(self.status())
    }

    /// Whether the scheduler should renew now
    pub fn needs_renewal(&self) -> bool {
        let config = self.config.read();
        if config.mode != CertMode::Automatic {
            return false;
        }
        match &self.state.read().current {
            Some(info) => info.is_expiring_within(i64::from(config.renew_before_days)),
            None => true,
        }
    }

    /// One scheduler cycle. Returns whether a new certificate was installed.
    pub async fn check_and_renew(&self) -> Result<bool> {
        if !self.needs_renewal() {
            debug!("Certificate renewal not due");
            return Ok(false);
        }
        self.renew().await.map(|_| true)
    }

    async fn renew(&self) -> Result<()> {
        let _guard = self.renewal.lock().await;
        let config = self.config();

        let outcome = self.issue_and_install(&config).await;
        match &outcome {
            Ok(info) => {
                metrics::counter!("pbx_cert_renewals_total", "outcome" => "success").increment(1);
                info!(
                    "TLS certificate renewed for {:?}, valid until {}",
                    config.domains, info.not_after
                );
                let mut state = self.state.write();
                state.last_renewal = Some(Utc::now());
                state.last_error = None;
            }
            Err(e) => {
                metrics::counter!("pbx_cert_renewals_total", "outcome" => "failure").increment(1);
                error!("TLS certificate renewal failed: {}", e);
                self.state.write().last_error = Some(e.to_string());
            }
        }

        if outcome.is_ok() {
            self.push_to_trunk().await;
        }
        outcome.map(|_| ())
    }

    async fn issue_and_install(&self, config: &TlsConfig) -> Result<CertificateInfo> {
        let issuer = self
            .issuer
            .clone()
            .ok_or_else(|| DomainError::RenewalFailed("no certificate issuer configured".into()))?;

        let challenge = match config.challenge {
            ChallengeType::Http01 => Challenge::Http01,
            ChallengeType::Dns01 => Challenge::Dns01 {
                provider: config.dns_provider.clone().unwrap_or_default(),
                token: config.dns_provider_token.clone().unwrap_or_default(),
            },
        };

        let timeout = config.issuer_timeout();
        let issued = tokio::time::timeout(
            timeout,
            issuer.issue(config.domains.clone(), config.contact_email.clone(), challenge),
        )
        .await
        .map_err(|_| DomainError::RenewalFailed(format!("issuer timed out after {:?}", timeout)))?
        .map_err(DomainError::RenewalFailed)?;

        let loaded = LoadedCertificate::from_pem(
            issued.certificate_pem.as_bytes(),
            issued.private_key_pem.as_bytes(),
        )
        .map_err(|e| DomainError::RenewalFailed(format!("issuer returned unusable PEM: {}", e)))?;

        if !loaded.info.is_valid() {
            return Err(DomainError::RenewalFailed(
                "issued certificate is not currently valid".into(),
            ));
        }
        if let Some(missing) = config.domains.iter().find(|d| !loaded.info.covers(d)) {
            return Err(DomainError::RenewalFailed(format!(
                "issued certificate does not cover {}",
                missing
            )));
        }

        let (cert_path, key_path) = Self::paths(config)?;
        write_pair_atomically(
            (&cert_path, issued.certificate_pem.as_bytes()),
            (&key_path, issued.private_key_pem.as_bytes()),
        )?;

        let info = loaded.info.clone();
        self.install(loaded)?;
        Ok(info)
    }

    fn install(&self, loaded: LoadedCertificate) -> Result<()> {
        self.resolver.install(&loaded)?;
        let info = loaded.info;
        if !info.is_valid() {
            warn!(
                "Installed TLS certificate {} is outside its validity window ({} - {})",
                info.subject, info.not_before, info.not_after
            );
        }
        metrics::gauge!("pbx_tls_certificate_expiry_timestamp").set(info.not_after.timestamp() as f64);
        let mut state = self.state.write();
        state.current = Some(info);
        state.last_error = None;
        Ok(())
    }

    async fn push_to_trunk(&self) {
        let (Some(trunk), Some(info)) = (self.trunk.clone(), self.current()) else {
            return;
        };
        match tokio::time::timeout(
            TRUNK_PUSH_TIMEOUT,
            trunk.update_certificate(info.fingerprint_sha256.clone(), info.not_after),
        )
        .await
        {
            Ok(Ok(())) => debug!("Trunk TLS fingerprint updated"),
            Ok(Err(e)) => warn!("Trunk TLS update failed: {}", e),
            Err(_) => warn!("Trunk TLS update timed out after {:?}", TRUNK_PUSH_TIMEOUT),
        }
    }

    fn paths(config: &TlsConfig) -> Result<(PathBuf, PathBuf)> {
        match (&config.certificate_path, &config.private_key_path) {
            (Some(cert), Some(key)) => Ok((cert.clone(), key.clone())),
            _ => Err(DomainError::Tls(
                "tls.certificate_path and tls.private_key_path are required".into(),
            )),
        }
    }

    fn load_from_disk(config: &TlsConfig) -> Result<LoadedCertificate> {
        let (cert_path, key_path) = Self::paths(config)?;
        let mut loaded = LoadedCertificate::from_files(&cert_path, &key_path)?;

        if let Some(ca_path) = &config.ca_bundle_path {
            let pem = std::fs::read(ca_path).map_err(|e| {
                DomainError::Tls(format!("Failed to read {}: {}", ca_path.display(), e))
            })?;
            loaded.chain.extend(load_certs(&pem)?);
        }
        Ok(loaded)
    }

    pub fn next_renewal(&self) -> Option<DateTime<Utc>> {
        let config = self.config.read();
        if config.mode != CertMode::Automatic {
            return None;
        }
        let state = self.state.read();
        let due = state
            .current
            .as_ref()
            .map(|info| info.not_after - ChronoDuration::days(i64::from(config.renew_before_days)));
        let earliest = Utc::now();
        Some(due.map_or(earliest, |due| due.max(earliest)))
    }

    pub fn status(&self) -> CertStatus {
        let next_renewal = self.next_renewal();
        let config = self.config.read();
        let state = self.state.read();
        let current = state.current.as_ref();

        CertStatus {
            mode: config.mode,
            domains: match current {
                Some(info) if config.domains.is_empty() => info.san_dns_names.clone(),
                _ => config.domains.clone(),
            },
            expires_at: current.map(|i| i.not_after),
            issuer: current.map(|i| i.issuer.clone()),
            subject: current.map(|i| i.subject.clone()),
            fingerprint: current.map(|i| i.fingerprint_sha256.clone()),
            valid: current.map(|i| i.is_valid()).unwrap_or(false),
            days_remaining: current.map(|i| i.days_until_expiration()),
            last_renewal: state.last_renewal,
            next_renewal,
            last_error: state.last_error.clone(),
        }
    }
}

fn write_error(path: &Path, e: std::io::Error) -> DomainError {
    DomainError::RenewalFailed(format!("failed to write {}: {}", path.display(), e))
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `contents` next to `path` as `<name>.tmp`, created with `mode`
fn stage(path: &Path, contents: &[u8], mode: u32) -> Result<PathBuf> {
    use std::io::Write;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| write_error(parent, e))?;
    }
    let tmp = tmp_path(path);
    // a leftover file would keep its old mode
    let _ = std::fs::remove_file(&tmp);

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(&tmp).map_err(|e| write_error(&tmp, e))?;
    file.write_all(contents)
        .and_then(|_| file.sync_all())
        .map_err(|e| write_error(&tmp, e))?;
    Ok(tmp)
}

/// Stage certificate and key before either replaces the live file
fn write_pair_atomically(cert: (&Path, &[u8]), key: (&Path, &[u8])) -> Result<()> {
    let cert_tmp = stage(cert.0, cert.1, 0o644)?;
    let key_tmp = match stage(key.0, key.1, 0o600) {
        Ok(tmp) => tmp,
        Err(e) => {
            let _ = std::fs::remove_file(&cert_tmp);
            return Err(e);
        }
    };

    if let Err(e) = std::fs::rename(&key_tmp, key.0) {
        let _ = std::fs::remove_file(&cert_tmp);
        let _ = std::fs::remove_file(&key_tmp);
        return Err(write_error(key.0, e));
    }
    std::fs::rename(&cert_tmp, cert.0).map_err(|e| write_error(cert.0, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;
    use tempfile::TempDir;

    fn pem_pair(names: &[&str], valid_days: i64) -> IssuedCertificate {
        let mut params =
            rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>());
        let not_after = Utc::now() + ChronoDuration::days(valid_days);
        params.not_after =
            rcgen::date_time_ymd(not_after.year(), not_after.month() as u8, not_after.day() as u8);
        let cert = rcgen::Certificate::from_params(params).unwrap();
        IssuedCertificate {
            certificate_pem: cert.serialize_pem().unwrap(),
            private_key_pem: cert.serialize_private_key_pem(),
        }
    }

    fn write_pair(dir: &TempDir, pair: &IssuedCertificate) -> (PathBuf, PathBuf) {
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, &pair.certificate_pem).unwrap();
        std::fs::write(&key, &pair.private_key_pem).unwrap();
        (cert, key)
    }

    #[tokio::test]
    async fn test_manual_reload_swaps_certificate() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, &pem_pair(&["pbx.example.com"], 200));
        let manager = CertificateManager::new(TlsConfig::manual(cert, key)).unwrap();
        manager.initialize().await.unwrap();

        let before = manager.status();
        assert!(before.valid);
        assert_eq!(before.mode, CertMode::Manual);
        assert_eq!(before.domains, vec!["pbx.example.com".to_string()]);
        assert!(before.next_renewal.is_none());

        write_pair(&dir, &pem_pair(&["pbx.example.com"], 300));
        let after = manager.reload().await.unwrap();
        assert_ne!(before.fingerprint, after.fingerprint);
        assert!(after.days_remaining.unwrap() > 250);
        assert!(manager.acceptor().is_ok());
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_serving() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, &pem_pair(&["pbx.example.com"], 200));
        let manager = CertificateManager::new(TlsConfig::manual(cert.clone(), key)).unwrap();
        manager.reload().await.unwrap();
        let fingerprint = manager.status().fingerprint;

        std::fs::write(&cert, "garbage").unwrap();
        assert!(manager.reload().await.is_err());

        let status = manager.status();
        assert_eq!(status.fingerprint, fingerprint);
        assert!(status.last_error.is_some());
        assert!(manager.resolver().has_certificate());
    }

    #[tokio::test]
    async fn test_force_renewal_rejected_in_manual_mode() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, &pem_pair(&["pbx.example.com"], 200));
        let mut issuer = MockCertificateIssuer::new();
        issuer.expect_issue().never();
        let manager = CertificateManager::new(TlsConfig::manual(cert, key))
            .unwrap()
            .with_issuer(Arc::new(issuer));

        let err = manager.force_renewal().await.unwrap_err();
        assert!(matches!(err, DomainError::ModeMismatch { .. }));
        assert!(!manager.check_and_renew().await.unwrap());
    }

    #[tokio::test]
    async fn test_automatic_renewal_writes_and_pushes() {
        let dir = TempDir::new().unwrap();
        let (cert, key) = write_pair(&dir, &pem_pair(&["pbx.example.com"], 10));
        let config = TlsConfig::automatic(vec!["pbx.example.com".into()], cert.clone(), key.clone())
            .with_dns_challenge("cloudflare", "secret-token");

        let fresh = pem_pair(&["pbx.example.com"], 90);
        let fresh_pem = fresh.certificate_pem.clone();
        let fresh_key_pem = fresh.private_key_pem.clone();
        let mut issuer = MockCertificateIssuer::new();
        issuer
            .expect_issue()
            .withf(|domains, _, challenge| {
                domains == &vec!["pbx.example.com".to_string()]
                    && challenge
                        == &Challenge::Dns01 {
                            provider: "cloudflare".into(),
                            token: "secret-token".into(),
                        }
            })
            .times(1)
            .returning(move |_, _, _| Ok(fresh.clone()));
        let mut trunk = MockTrunkTlsClient::new();
        trunk.expect_update_certificate().times(2).returning(|_, _| Ok(()));

        let manager = CertificateManager::new(config)
            .unwrap()
            .with_issuer(Arc::new(issuer))
            .with_trunk_client(Arc::new(trunk));
        manager.initialize().await.unwrap();
        assert!(manager.needs_renewal());

        assert!(manager.check_and_renew().await.unwrap());
        let status = manager.status();
        assert!(status.last_renewal.is_some());
        assert!(status.last_error.is_none());
        assert!(status.days_remaining.unwrap() > 80);
        assert_eq!(std::fs::read_to_string(&cert).unwrap(), fresh_pem);
        assert_eq!(std::fs::read_to_string(&key).unwrap(), fresh_key_pem);

        // renewed certificate is no longer inside the renewal window
        assert!(!manager.check_and_renew().await.unwrap());
    }

    #[test]
    fn test_pair_write_replaces_both_files() {
        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("tls").join("pbx.crt");
        let key = dir.path().join("tls").join("pbx.key");

        write_pair_atomically((&cert, b"CERT-1"), (&key, b"KEY-1")).unwrap();
        write_pair_atomically((&cert, b"CERT-2"), (&key, b"KEY-2")).unwrap();
        assert_eq!(std::fs::read(&cert).unwrap(), b"CERT-2");
        assert_eq!(std::fs::read(&key).unwrap(), b"KEY-2");
        assert!(!tmp_path(&cert).exists());
        assert!(!tmp_path(&key).exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_private_key_written_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        // a stale temp file with open permissions must not leak its mode
        std::fs::write(tmp_path(&key), b"old").unwrap();
        std::fs::set_permissions(
            tmp_path(&key),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        write_pair_atomically((&cert, b"CERT"), (&key, b"KEY")).unwrap();
        let mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(mode & 0o077, 0);
        assert_eq!(mode & 0o600, 0o600);
    }

    #[tokio::test]
    async fn test_renewal_failure_recorded() {
        let dir = TempDir::new().unwrap();
        let config = TlsConfig::automatic(
            vec!["pbx.example.com".into()],
            dir.path().join("cert.pem"),
            dir.path().join("key.pem"),
        );
        let mut issuer = MockCertificateIssuer::new();
        issuer
            .expect_issue()
            .times(1)
            .returning(|_, _, _| Err("rate limited".to_string()));
        let manager = CertificateManager::new(config)
            .unwrap()
            .with_issuer(Arc::new(issuer));
        manager.initialize().await.unwrap();

        let err = manager.force_renewal().await.unwrap_err();
        assert!(matches!(err, DomainError::RenewalFailed(_)));
        let status = manager.status();
        assert!(!status.valid);
        assert!(status.last_error.unwrap().contains("rate limited"));
        assert!(status.next_renewal.is_some());
    }

    #[tokio::test]
    async fn test_issued_certificate_must_cover_domains() {
        let dir = TempDir::new().unwrap();
        let config = TlsConfig::automatic(
            vec!["pbx.example.com".into()],
            dir.path().join("cert.pem"),
            dir.path().join("key.pem"),
        );
        let wrong = pem_pair(&["other.example.com"], 90);
        let mut issuer = MockCertificateIssuer::new();
        issuer.expect_issue().returning(move |_, _, _| Ok(wrong.clone()));
        let manager = CertificateManager::new(config)
            .unwrap()
            .with_issuer(Arc::new(issuer));

        assert!(manager.force_renewal().await.is_err());
        assert!(!manager.resolver().has_certificate());
        assert!(!dir.path().join("cert.pem").exists());
    }
}
