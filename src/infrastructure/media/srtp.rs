/// SRTP cipher policy and SDES crypto negotiation
/// RFC 3711 profiles, RFC 4568 `a=crypto` attributes, RFC 7714 AEAD profiles
use crate::config::SrtpConfig;
use crate::domain::shared::{DomainError, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info};

/// SRTP protection profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SrtpProfile {
    /// AES-128-CM with HMAC-SHA1-80 (default)
    #[serde(rename = "AES_CM_128_HMAC_SHA1_80")]
    AesCm128HmacSha1_80,
    /// AES-128-CM with HMAC-SHA1-32
    #[serde(rename = "AES_CM_128_HMAC_SHA1_32")]
    AesCm128HmacSha1_32,
    #[serde(rename = "AEAD_AES_128_GCM")]
    AeadAes128Gcm,
    #[serde(rename = "AEAD_AES_256_GCM")]
    AeadAes256Gcm,
}

impl SrtpProfile {
    pub const ALL: [SrtpProfile; 4] = [
        SrtpProfile::AesCm128HmacSha1_80,
        SrtpProfile::AesCm128HmacSha1_32,
        SrtpProfile::AeadAes128Gcm,
        SrtpProfile::AeadAes256Gcm,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            Self::AesCm128HmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
            Self::AeadAes128Gcm => "AEAD_AES_128_GCM",
            Self::AeadAes256Gcm => "AEAD_AES_256_GCM",
        }
    }

    /// Get master key length in bytes
    pub fn master_key_len(&self) -> usize {
        match self {
            Self::AeadAes256Gcm => 32,
            _ => 16,
        }
    }

    /// Get master salt length in bytes
    pub fn master_salt_len(&self) -> usize {
        match self {
            Self::AeadAes128Gcm | Self::AeadAes256Gcm => 12,
            _ => 14,
        }
    }

    /// Get auth tag length in bytes
    pub fn auth_tag_len(&self) -> usize {
        match self {
            Self::AesCm128HmacSha1_80 => 10,
            Self::AesCm128HmacSha1_32 => 4,
            Self::AeadAes128Gcm | Self::AeadAes256Gcm => 16,
        }
    }
}

impl fmt::Display for SrtpProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SrtpProfile {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DomainError::ValidationError(format!("Unknown SRTP profile: {}", s)))
    }
}

/// SRTP master key material
#[derive(Clone, PartialEq, Eq)]
pub struct SrtpMasterKey {
    pub key: Vec<u8>,
    pub salt: Vec<u8>,
}

impl fmt::Debug for SrtpMasterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SrtpMasterKey")
            .field("key_len", &self.key.len())
            .field("salt_len", &self.salt.len())
            .finish()
    }
}

impl SrtpMasterKey {
    pub fn new(key: Vec<u8>, salt: Vec<u8>) -> Self {
        Self { key, salt }
    }

    /// Generate random master key for profile
    pub fn generate(profile: SrtpProfile) -> Self {
        let mut rng = rand::thread_rng();
        let mut key = vec![0u8; profile.master_key_len()];
        let mut salt = vec![0u8; profile.master_salt_len()];
        rng.fill_bytes(&mut key);
        rng.fill_bytes(&mut salt);
        Self { key, salt }
    }

    /// `inline:` key-params value (key || salt, base64)
    pub fn to_inline(&self) -> String {
        let mut material = self.key.clone();
        material.extend_from_slice(&self.salt);
        format!("inline:{}", STANDARD.encode(material))
    }

    pub fn from_inline(profile: SrtpProfile, key_params: &str) -> Result<Self> {
        let encoded = key_params
            .strip_prefix("inline:")
            .ok_or_else(|| DomainError::ValidationError("Key params must be inline".into()))?;
        // Drop optional |lifetime|MKI suffixes
        let encoded = encoded.split('|').next().unwrap_or_default();
        let material = STANDARD
            .decode(encoded)
            .map_err(|e| DomainError::ValidationError(format!("Invalid key material: {}", e)))?;

        let key_len = profile.master_key_len();
        if material.len() != key_len + profile.master_salt_len() {
            return Err(DomainError::ValidationError(format!(
                "{} needs {} bytes of key material, got {}",
                profile,
                key_len + profile.master_salt_len(),
                material.len()
            )));
        }
        Ok(Self::new(
            material[..key_len].to_vec(),
            material[key_len..].to_vec(),
        ))
    }
}

/// One SDES `a=crypto` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoAttribute {
    pub tag: u32,
    pub profile: SrtpProfile,
    pub key_params: String,
}

impl CryptoAttribute {
    /// Parse `a=crypto:<tag> <suite> <key-params>` (the `a=` prefix is optional)
    pub fn parse(line: &str) -> Result<Self> {
        let value = line
            .trim()
            .trim_start_matches("a=")
            .strip_prefix("crypto:")
            .ok_or_else(|| DomainError::ValidationError(format!("Not a crypto line: {}", line)))?;

        let mut parts = value.split_whitespace();
        let (Some(tag), Some(suite), Some(key_params)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(DomainError::ValidationError(format!(
                "Malformed crypto line: {}",
                line
            )));
        };

        Ok(Self {
            tag: tag
                .parse()
                .map_err(|_| DomainError::ValidationError(format!("Invalid crypto tag: {}", tag)))?,
            profile: suite.parse()?,
            key_params: key_params.to_string(),
        })
    }

    /// All parseable crypto lines in an SDP body; unknown suites are skipped
    pub fn from_sdp(sdp: &str) -> Vec<Self> {
        sdp.lines()
            .filter(|l| l.trim_start().starts_with("a=crypto:"))
            .filter_map(|l| Self::parse(l).ok())
            .collect()
    }
}

impl fmt::Display for CryptoAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "a=crypto:{} {} {}", self.tag, self.profile, self.key_params)
    }
}

/// Negotiated crypto for one media stream
#[derive(Debug, Clone)]
pub struct SrtpSelection {
    pub profile: SrtpProfile,
    pub remote_key: SrtpMasterKey,
    pub local_key: SrtpMasterKey,
    /// Answer line to put in our SDP
    pub answer: CryptoAttribute,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrtpStatus {
    pub enabled: bool,
    pub require_srtp: bool,
    pub profiles: Vec<SrtpProfile>,
}

#[derive(Debug, Clone)]
struct PolicyState {
    enabled: bool,
    require_srtp: bool,
    profiles: Vec<SrtpProfile>,
}

impl PolicyState {
    fn from_config(config: &SrtpConfig) -> Result<Self> {
        let profiles = config
            .profiles
            .iter()
            .map(|p| p.parse())
            .collect::<Result<Vec<SrtpProfile>>>()?;
        if config.enabled && profiles.is_empty() {
            return Err(DomainError::ValidationError(
                "SRTP enabled with no allowed profiles".to_string(),
            ));
        }
        Ok(Self {
            enabled: config.enabled,
            require_srtp: config.require_srtp,
            profiles,
        })
    }
}

/// Allowed SRTP profiles in local preference order
pub struct SrtpPolicy {
    state: RwLock<PolicyState>,
}

impl SrtpPolicy {
    pub fn new(config: &SrtpConfig) -> Result<Self> {
        Ok(Self {
            state: RwLock::new(PolicyState::from_config(config)?),
        })
    }

    /// Parse a section without applying it
    pub fn check(config: &SrtpConfig) -> Result<()> {
        PolicyState::from_config(config).map(|_| ())
    }

    pub fn reload(&self, config: &SrtpConfig) -> Result<()> {
        let state = PolicyState::from_config(config)?;
        info!(
            "SRTP policy reloaded: require={} profiles={:?}",
            state.require_srtp, state.profiles
        );
        *self.state.write() = state;
        Ok(())
    }

    pub fn is_allowed(&self, profile: SrtpProfile) -> bool {
        let state = self.state.read();
        state.enabled && state.profiles.contains(&profile)
    }

    /// Pick our most preferred profile among the peer's offers.
    ///
    /// `Ok(None)` means plain RTP; that is only allowed when SRTP is not
    /// required.
    pub fn negotiate(&self, offers: &[CryptoAttribute]) -> Result<Option<SrtpSelection>> {
        let state = self.state.read().clone();

        if !state.enabled {
            return Ok(None);
        }

        for profile in &state.profiles {
            let Some(offer) = offers.iter().find(|o| o.profile == *profile) else {
                continue;
            };
            let remote_key = match SrtpMasterKey::from_inline(*profile, &offer.key_params) {
                Ok(key) => key,
                Err(e) => {
                    debug!("Skipping crypto tag {}: {}", offer.tag, e);
                    continue;
                }
            };
            let local_key = SrtpMasterKey::generate(*profile);
            let answer = CryptoAttribute {
                tag: offer.tag,
                profile: *profile,
                key_params: local_key.to_inline(),
            };
            return Ok(Some(SrtpSelection {
                profile: *profile,
                remote_key,
                local_key,
                answer,
            }));
        }

        if state.require_srtp {
            return Err(DomainError::ValidationError(
                "No acceptable SRTP profile offered and SRTP is required".to_string(),
            ));
        }
        Ok(None)
    }

    /// Crypto lines for an outbound offer, one per allowed profile
    pub fn offer(&self) -> Vec<(CryptoAttribute, SrtpMasterKey)> {
        let state = self.state.read();
        if !state.enabled {
            return Vec::new();
        }
        state
            .profiles
            .iter()
            .enumerate()
            .map(|(i, profile)| {
                let key = SrtpMasterKey::generate(*profile);
                let attribute = CryptoAttribute {
                    tag: i as u32 + 1,
                    profile: *profile,
                    key_params: key.to_inline(),
                };
                (attribute, key)
            })
            .collect()
    }

    pub fn status(&self) -> SrtpStatus {
        let state = self.state.read();
        SrtpStatus {
            enabled: state.enabled,
            require_srtp: state.require_srtp,
            profiles: state.profiles.clone(),
        }
    }
}
