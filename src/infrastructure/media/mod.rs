//! Media processing implementations

pub mod moh;
pub mod srtp;
pub mod zrtp;

pub use moh::{HoldAsset, MohManager, MohStatus, ToneGenerator};
pub use srtp::{CryptoAttribute, SrtpMasterKey, SrtpPolicy, SrtpProfile, SrtpSelection, SrtpStatus};
pub use zrtp::{SecurityWarning, ZrtpManager, ZrtpSessionInfo, ZrtpState, ZrtpStatus};
