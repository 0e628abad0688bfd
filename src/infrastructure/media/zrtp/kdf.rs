//! ZRTP key derivation (RFC 6189 §4.4.1.4, §4.5) and SAS rendering

use crate::domain::shared::{DomainError, Result};
use crate::infrastructure::media::srtp::SrtpMasterKey;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// ZRTP identifier, 96 bits
pub type Zid = [u8; 12];

/// Length of an rs1ID/rs2ID on the wire
pub const RS_ID_LEN: usize = 8;

/// Base-32 alphabet for SAS rendering (RFC 6189 §5.1.6)
const B32_ALPHABET: &[u8; 32] = b"ybndrfg8ejkmcpqxot1uwisza345h769";

const KDF_LABEL_S0: &[u8] = b"ZRTP-HMAC-KDF";

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| DomainError::Internal(format!("HMAC key rejected: {}", e)))?;
    for part in parts {
        mac.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// KDF(KI, Label, Context, L) = HMAC(KI, i || Label || 0x00 || Context || L)
pub fn kdf(key: &[u8], label: &[u8], context: &[u8], bits: u32) -> Result<Vec<u8>> {
    let out = hmac_sha256(
        key,
        &[&1u32.to_be_bytes(), label, &[0x00], context, &bits.to_be_bytes()],
    )?;
    Ok(out[..(bits as usize / 8).min(out.len())].to_vec())
}

/// rs1ID / rs2ID: leftmost 64 bits of HMAC(rs, role label)
pub fn retained_secret_id(rs: &[u8], role_label: &str) -> Result<[u8; RS_ID_LEN]> {
    let mac = hmac_sha256(rs, &[role_label.as_bytes()])?;
    let mut id = [0u8; RS_ID_LEN];
    id.copy_from_slice(&mac[..RS_ID_LEN]);
    Ok(id)
}

/// Which side of the exchange a ZID plays; the lower ZID initiates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

impl Role {
    pub fn of(local: &Zid, peer: &Zid) -> Self {
        if local < peer {
            Role::Initiator
        } else {
            Role::Responder
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Initiator => "Initiator",
            Role::Responder => "Responder",
        }
    }

    pub fn other(&self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

/// Material derived from one completed DH exchange
#[derive(Clone)]
pub struct KeyMaterial {
    s0: Vec<u8>,
    context: Vec<u8>,
}

impl KeyMaterial {
    /// s0 = hash(counter || DHResult || "ZRTP-HMAC-KDF" || ZIDi || ZIDr ||
    /// total_hash || len(s1) || s1 || len(s2) || s2 || len(s3) || s3)
    pub fn derive(
        dh_result: &[u8],
        zid_i: &Zid,
        zid_r: &Zid,
        total_hash: &[u8],
        s1: Option<&[u8]>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(1u32.to_be_bytes());
        hasher.update(dh_result);
        hasher.update(KDF_LABEL_S0);
        hasher.update(zid_i);
        hasher.update(zid_r);
        hasher.update(total_hash);
        match s1 {
            Some(secret) => {
                hasher.update((secret.len() as u32).to_be_bytes());
                hasher.update(secret);
            }
            None => hasher.update(0u32.to_be_bytes()),
        }
        // s2 (auxsecret) and s3 (pbxsecret) are never used
        hasher.update(0u32.to_be_bytes());
        hasher.update(0u32.to_be_bytes());
        let s0 = hasher.finalize().to_vec();

        let mut context = Vec::with_capacity(24 + total_hash.len());
        context.extend_from_slice(zid_i);
        context.extend_from_slice(zid_r);
        context.extend_from_slice(total_hash);

        Self { s0, context }
    }

    /// Four-character base-32 SAS
    pub fn sas(&self) -> Result<String> {
        let sashash = kdf(&self.s0, b"SAS", &self.context, 256)?;
        Ok(render_sas_b32(&sashash))
    }

    /// Next retained secret for the peer cache
    pub fn retained_secret(&self) -> Result<Vec<u8>> {
        kdf(&self.s0, b"retained secret", &self.context, 256)
    }

    /// SRTP master key and salt for the given role
    pub fn srtp_master(&self, role: Role) -> Result<SrtpMasterKey> {
        let label = role.label();
        let key = kdf(
            &self.s0,
            format!("{} SRTP master key", label).as_bytes(),
            &self.context,
            128,
        )?;
        let salt = kdf(
            &self.s0,
            format!("{} SRTP master salt", label).as_bytes(),
            &self.context,
            112,
        )?;
        Ok(SrtpMasterKey::new(key, salt))
    }
}

/// Hash over both public values in initiator-then-responder order
pub fn total_hash(initiator_public: &[u8], responder_public: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(initiator_public);
    hasher.update(responder_public);
    hasher.finalize().to_vec()
}

/// Render the leftmost 20 bits of `sashash` as four base-32 characters
pub fn render_sas_b32(sashash: &[u8]) -> String {
    let mut bits: u32 = 0;
    for byte in sashash.iter().take(4) {
        bits = (bits << 8) | *byte as u32;
    }
    let mut out = String::with_capacity(4);
    for i in 0..4 {
        let index = (bits >> (27 - i * 5)) & 0x1f;
        out.push(B32_ALPHABET[index as usize] as char);
    }
    out
}
