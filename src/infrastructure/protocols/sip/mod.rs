//! SIP-side call control
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────────────────┐
//! │ HoldManager / TransferManager / Registrar│
//! └───────────────────┬──────────────────────┘
//!                     │ SignalingClient (port)
//! ┌───────────────────▼──────────────────────┐
//! │ UdpSignaling (rsip over UDP)             │
//! └──────────────────────────────────────────┘
//! ```

pub mod hold_manager;
pub mod registrar;
pub mod sdp;
pub mod signaling;
pub mod transfer_manager;

pub use hold_manager::HoldManager;
pub use registrar::Registrar;
pub use sdp::{MediaDirection, SdpSession};
pub use signaling::{SignalingClient, SignalingError, SignalingNotifier, UdpSignaling};
pub use transfer_manager::TransferManager;
