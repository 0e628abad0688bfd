//! Infrastructure layer - Technical implementations
//!
//! This layer contains:
//! - SIP signaling and the SIP-side managers (hold, transfer, registrar)
//! - Media security and hold audio (SRTP, ZRTP, MOH)
//! - TLS certificate lifecycle

pub mod media;
pub mod protocols;
pub mod tls;
