//! TLS / SRTP / ZRTP status DTOs

use crate::application::Pbx;
use crate::infrastructure::media::srtp::SrtpStatus;
use crate::infrastructure::media::zrtp::{ZrtpSessionInfo, ZrtpStatus};
use crate::infrastructure::tls::CertStatus;
use serde::{Deserialize, Serialize};

/// TLS status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsStatusDto {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertStatus>,
}

/// SRTP status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrtpStatusDto {
    pub enabled: bool,
    pub require_srtp: bool,
    pub profiles: Vec<String>,
}

impl From<SrtpStatus> for SrtpStatusDto {
    fn from(status: SrtpStatus) -> Self {
        SrtpStatusDto {
            enabled: status.enabled,
            require_srtp: status.require_srtp,
            profiles: status.profiles.iter().map(|p| p.as_str().to_string()).collect(),
        }
    }
}

/// ZRTP status with per-call sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZrtpStatusDto {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<ZrtpStatus>,
    pub sessions: Vec<ZrtpSessionInfo>,
}

/// Everything the presentation layer shows on the security page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub tls: TlsStatusDto,
    pub srtp: SrtpStatusDto,
    pub zrtp: ZrtpStatusDto,
}

impl SecurityStatus {
    pub fn collect(pbx: &Pbx) -> Self {
        let tls = TlsStatusDto {
            enabled: pbx.certificates().is_some(),
            certificate: pbx.certificates().map(|c| c.status()),
        };

        let srtp = match pbx.srtp() {
            Some(policy) => SrtpStatusDto::from(policy.status()),
            None => SrtpStatusDto {
                enabled: false,
                require_srtp: false,
                profiles: Vec::new(),
            },
        };

        let zrtp = match pbx.zrtp() {
            Some(manager) => ZrtpStatusDto {
                enabled: true,
                summary: Some(manager.status()),
                sessions: manager.list(),
            },
            None => ZrtpStatusDto {
                enabled: false,
                summary: None,
                sessions: Vec::new(),
            },
        };

        Self { tls, srtp, zrtp }
    }
}
