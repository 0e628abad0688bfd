//! TLS for SIP signaling: certificate loading, hot swap and renewal

pub mod certificate;
pub mod config;
pub mod manager;
pub mod resolver;

pub use certificate::{CertificateInfo, LoadedCertificate};
pub use manager::{
    CertStatus, CertificateIssuer, CertificateManager, Challenge, IssuedCertificate, TrunkTlsClient,
};
pub use resolver::SwappableCertResolver;
