//! ZRTP key agreement (RFC 6189)
//!
//! P-256 Diffie-Hellman, SHA-256 KDF, base-32 SAS and a retained-secret
//! cache so returning peers skip the manual SAS comparison.

pub mod cache;
pub mod kdf;
pub mod manager;
pub mod session;

pub use cache::{CachedSecret, ZidCache};
pub use kdf::Zid;
pub use manager::{
    SecurityWarning, SecurityWarningKind, ZrtpManager, ZrtpSrtpKeys, ZrtpStateCounts, ZrtpStatus,
};
pub use session::{ZrtpSessionInfo, ZrtpState};
