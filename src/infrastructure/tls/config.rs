/// rustls server configuration for SIP over TLS
use super::resolver::SwappableCertResolver;
use crate::domain::shared::{DomainError, Result};
use rustls::ServerConfig;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

fn protocol_versions(min_version: &str) -> Result<&'static [&'static rustls::SupportedProtocolVersion]> {
    static TLS12_AND_UP: &[&rustls::SupportedProtocolVersion] =
        &[&rustls::version::TLS13, &rustls::version::TLS12];
    static TLS13_ONLY: &[&rustls::SupportedProtocolVersion] = &[&rustls::version::TLS13];

    match min_version {
        "1.2" => Ok(TLS12_AND_UP),
        "1.3" => Ok(TLS13_ONLY),
        other => Err(DomainError::Tls(format!("Unsupported TLS version: {}", other))),
    }
}

/// Server config that always asks the resolver for the current certificate
pub fn build_server_config(
    resolver: Arc<SwappableCertResolver>,
    min_version: &str,
) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(protocol_versions(min_version)?)
        .map_err(|e| DomainError::Tls(format!("Failed to build TLS config: {}", e)))?
        .with_no_client_auth()
        .with_cert_resolver(resolver);

    Ok(Arc::new(config))
}

pub fn build_acceptor(resolver: Arc<SwappableCertResolver>, min_version: &str) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(build_server_config(resolver, min_version)?))
}
