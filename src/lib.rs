//! pbx-core - call control and media security for a SIP PBX
//!
//! Session registry and call state machine, hold and transfer orchestration,
//! registrar, MWI, ZRTP key agreement, SRTP policy and the TLS certificate
//! lifecycle, laid out in domain / application / infrastructure layers.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod interface;

// Re-export commonly used types
pub use application::{Pbx, PbxBuilder};
pub use domain::shared::error::DomainError;
pub use domain::shared::result::Result;
