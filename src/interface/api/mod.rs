//! DTOs and metrics consumed by the presentation layer

pub mod call_dto;
pub mod metrics;
pub mod mwi_dto;
pub mod security_dto;

pub use call_dto::{CallListResponse, CallSummary};
pub use metrics::{init_metrics, update_gauges};
pub use mwi_dto::MwiStatusDto;
pub use security_dto::SecurityStatus;
