//! Application layer - the PBX facade and its background tasks

pub mod background;
pub mod pbx;

pub use pbx::{Pbx, PbxBuilder};
