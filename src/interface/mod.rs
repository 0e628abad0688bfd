//! Interface layer - shapes handed to the external presentation layer
//!
//! No HTTP routes live here; the API server is a separate service.

pub mod api;
