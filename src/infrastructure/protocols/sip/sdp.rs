//! SDP offers and the direction rewrites used for hold and resume

use crate::infrastructure::media::srtp::CryptoAttribute;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Media direction attribute (RFC 3264 §5.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    SendRecv,
    /// We keep sending (hold audio), the peer stops
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    fn from_attribute(value: &str) -> Option<Self> {
        match value {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }

    /// Direction the far end sees for the same stream
    pub fn reversed(&self) -> Self {
        match self {
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            other => *other,
        }
    }

    pub fn is_hold(&self) -> bool {
        !matches!(self, MediaDirection::SendRecv)
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rewrite every direction attribute in `sdp` to `direction`.
///
/// Media sections without an explicit attribute get one right after their
/// `m=` line; a session-level attribute is rewritten in place.
pub fn set_direction(sdp: &str, direction: MediaDirection) -> String {
    let mut out: Vec<String> = Vec::new();
    let mut media_has_direction = true;

    for line in sdp.lines().map(|l| l.trim_end_matches('\r')) {
        if line.is_empty() {
            continue;
        }
        if line.starts_with("m=") {
            if !media_has_direction {
                out.push(format!("a={}", direction));
            }
            media_has_direction = false;
            out.push(line.to_string());
            continue;
        }
        if let Some(attr) = line.strip_prefix("a=") {
            if MediaDirection::from_attribute(attr).is_some() {
                media_has_direction = true;
                out.push(format!("a={}", direction));
                continue;
            }
        }
        out.push(line.to_string());
    }
    if !media_has_direction {
        out.push(format!("a={}", direction));
    }

    let mut body = out.join("\r\n");
    body.push_str("\r\n");
    body
}

/// Effective direction of the first media section (session level as fallback)
pub fn detect_direction(sdp: &str) -> MediaDirection {
    let mut session_level = None;
    let mut in_media = false;

    for line in sdp.lines().map(|l| l.trim()) {
        if line.starts_with("m=") {
            if in_media {
                break;
            }
            in_media = true;
            continue;
        }
        if let Some(direction) = line.strip_prefix("a=").and_then(MediaDirection::from_attribute) {
            if in_media {
                return direction;
            }
            session_level = Some(direction);
        }
    }

    session_level.unwrap_or(MediaDirection::SendRecv)
}

/// Simple SDP session
#[derive(Debug, Clone)]
pub struct SdpSession {
    pub version: u32,
    pub origin: SdpOrigin,
    pub session_name: String,
    pub connection: SdpConnection,
    pub media: Vec<SdpMedia>,
}

#[derive(Debug, Clone)]
pub struct SdpOrigin {
    pub username: String,
    pub session_id: String,
    pub session_version: String,
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpConnection {
    pub network_type: String,
    pub address_type: String,
    pub address: String,
}

#[derive(Debug, Clone)]
pub struct SdpMedia {
    pub media_type: String,
    pub port: u16,
    /// "RTP/AVP" or "RTP/SAVP"
    pub protocol: String,
    pub formats: Vec<String>,
    /// (payload_type, encoding)
    pub rtpmap: Vec<(String, String)>,
    pub crypto: Vec<CryptoAttribute>,
    pub direction: MediaDirection,
}

impl SdpSession {
    /// G.711 audio offer with telephone-event
    pub fn create_audio_session(local_ip: IpAddr, local_port: u16) -> Self {
        let address_type = if local_ip.is_ipv4() { "IP4" } else { "IP6" }.to_string();
        Self {
            version: 0,
            origin: SdpOrigin {
                username: "pbx".to_string(),
                session_id: chrono::Utc::now().timestamp().to_string(),
                session_version: "1".to_string(),
                network_type: "IN".to_string(),
                address_type: address_type.clone(),
                address: local_ip.to_string(),
            },
            session_name: "PBX Call".to_string(),
            connection: SdpConnection {
                network_type: "IN".to_string(),
                address_type,
                address: local_ip.to_string(),
            },
            media: vec![SdpMedia {
                media_type: "audio".to_string(),
                port: local_port,
                protocol: "RTP/AVP".to_string(),
                formats: vec!["0".to_string(), "8".to_string(), "101".to_string()],
                rtpmap: vec![
                    ("0".to_string(), "PCMU/8000".to_string()),
                    ("8".to_string(), "PCMA/8000".to_string()),
                    ("101".to_string(), "telephone-event/8000".to_string()),
                ],
                crypto: Vec::new(),
                direction: MediaDirection::SendRecv,
            }],
        }
    }

    pub fn audio_media(&self) -> Option<&SdpMedia> {
        self.media.iter().find(|m| m.media_type == "audio")
    }

    pub fn set_direction(&mut self, direction: MediaDirection) {
        for media in &mut self.media {
            media.direction = direction;
        }
    }

    /// Attach SDES crypto lines to the audio stream and switch it to RTP/SAVP
    pub fn add_crypto(&mut self, lines: impl IntoIterator<Item = CryptoAttribute>) {
        if let Some(media) = self.media.iter_mut().find(|m| m.media_type == "audio") {
            media.protocol = "RTP/SAVP".to_string();
            media.crypto.extend(lines);
        }
    }

    pub fn is_srtp_enabled(&self) -> bool {
        self.audio_media()
            .map(|audio| !audio.crypto.is_empty() && audio.protocol.contains("SAVP"))
            .unwrap_or(false)
    }
}

impl fmt::Display for SdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v={}\r\n", self.version)?;
        write!(
            f,
            "o={} {} {} {} {} {}\r\n",
            self.origin.username,
            self.origin.session_id,
            self.origin.session_version,
            self.origin.network_type,
            self.origin.address_type,
            self.origin.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        write!(
            f,
            "c={} {} {}\r\n",
            self.connection.network_type, self.connection.address_type, self.connection.address
        )?;
        f.write_str("t=0 0\r\n")?;

        for media in &self.media {
            write!(
                f,
                "m={} {} {} {}\r\n",
                media.media_type,
                media.port,
                media.protocol,
                media.formats.join(" ")
            )?;
            for crypto in &media.crypto {
                write!(f, "{}\r\n", crypto)?;
            }
            for (pt, encoding) in &media.rtpmap {
                write!(f, "a=rtpmap:{} {}\r\n", pt, encoding)?;
            }
            write!(f, "a={}\r\n", media.direction)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::media::srtp::{SrtpMasterKey, SrtpProfile};

    const OFFER: &str = "v=0\r\no=- 123 456 IN IP4 192.168.1.1\r\ns=-\r\nc=IN IP4 192.168.1.1\r\nt=0 0\r\nm=audio 5004 RTP/AVP 0\r\na=sendrecv\r\n";

    #[test]
    fn test_hold_and_resume_rewrite() {
        let held = set_direction(OFFER, MediaDirection::SendOnly);
        assert!(held.contains("a=sendonly"));
        assert!(!held.contains("a=sendrecv"));
        assert_eq!(detect_direction(&held), MediaDirection::SendOnly);

        let resumed = set_direction(&held, MediaDirection::SendRecv);
        assert_eq!(resumed, OFFER);
    }

    #[test]
    fn test_direction_added_when_missing() {
        let bare = "v=0\r\nm=audio 5004 RTP/AVP 0\r\na=rtpmap:0 PCMU/8000\r\nm=video 5006 RTP/AVP 96\r\n";
        let held = set_direction(bare, MediaDirection::SendOnly);
        assert_eq!(held.matches("a=sendonly").count(), 2);
        assert_eq!(detect_direction(bare), MediaDirection::SendRecv);
    }

    #[test]
    fn test_detect_direction() {
        let inactive = "v=0\r\nm=audio 5004 RTP/AVP 0\r\na=inactive\r\n";
        assert_eq!(detect_direction(inactive), MediaDirection::Inactive);

        let session_level = "v=0\r\na=recvonly\r\nm=audio 5004 RTP/AVP 0\r\n";
        assert_eq!(detect_direction(session_level), MediaDirection::RecvOnly);

        assert_eq!(MediaDirection::SendOnly.reversed(), MediaDirection::RecvOnly);
        assert!(!MediaDirection::SendRecv.is_hold());
    }

    #[test]
    fn test_generated_offer_with_crypto() {
        let local_ip: IpAddr = "10.0.0.5".parse().unwrap();
        let mut sdp = SdpSession::create_audio_session(local_ip, 20000);
        assert!(!sdp.is_srtp_enabled());

        let key = SrtpMasterKey::generate(SrtpProfile::AesCm128HmacSha1_80);
        sdp.add_crypto([CryptoAttribute {
            tag: 1,
            profile: SrtpProfile::AesCm128HmacSha1_80,
            key_params: key.to_inline(),
        }]);
        sdp.set_direction(MediaDirection::SendOnly);

        let text = sdp.to_string();
        assert!(text.contains("m=audio 20000 RTP/SAVP 0 8 101"));
        assert!(text.contains("a=crypto:1 AES_CM_128_HMAC_SHA1_80 inline:"));

        assert!(sdp.is_srtp_enabled());
        assert_eq!(detect_direction(&text), MediaDirection::SendOnly);
        assert_eq!(CryptoAttribute::from_sdp(&text).len(), 1);
    }
}
