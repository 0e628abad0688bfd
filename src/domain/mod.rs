//! Domain layer - Core business logic and rules
//!
//! This layer contains:
//! - The call session aggregate and its state machine
//! - Registrations and MWI subscriptions
//! - Store ports and in-memory implementations
//! - Narrow ports onto external collaborators (voicemail counts, alerts)

pub mod audio;
pub mod call;
pub mod mwi;
pub mod registration;
pub mod shared;
pub mod voicemail;

// Re-export commonly used types
pub use shared::{DomainError, Result};
