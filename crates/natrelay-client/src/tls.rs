//! TLS connector for the control connection

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::TlsConnector;

use crate::error::ClientError;

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Connector trusting `ca_cert` if given, else the bundled web PKI roots
pub fn build_tls_connector(ca_cert: Option<&Path>) -> Result<TlsConnector, ClientError> {
    match ca_cert {
        Some(path) => {
            let file = File::open(path)
                .map_err(|e| ClientError::Tls(format!("Failed to open {}: {}", path.display(), e)))?;
            connector_with_roots(&mut BufReader::new(file))
        }
        None => {
            ensure_crypto_provider();
            let mut roots = rustls::RootCertStore::empty();
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            Ok(connector(roots))
        }
    }
}

/// Connector trusting only the certificates in `pem`
pub fn tls_connector_from_pem(pem: &[u8]) -> Result<TlsConnector, ClientError> {
    connector_with_roots(&mut &pem[..])
}

fn connector_with_roots(reader: &mut dyn BufRead) -> Result<TlsConnector, ClientError> {
    ensure_crypto_provider();

    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(reader) {
        let cert = cert.map_err(|e| ClientError::Tls(format!("Failed to parse certs: {}", e)))?;
        roots
            .add(cert)
            .map_err(|e| ClientError::Tls(format!("Invalid root cert: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(ClientError::Tls("No CA certificate found".to_string()));
    }
    Ok(connector(roots))
}

fn connector(roots: rustls::RootCertStore) -> TlsConnector {
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_roots() {
        assert!(build_tls_connector(None).is_ok());
    }

    #[test]
    fn test_custom_ca() {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        assert!(tls_connector_from_pem(cert.cert.pem().as_bytes()).is_ok());
    }

    #[test]
    fn test_empty_ca_rejected() {
        assert!(matches!(
            tls_connector_from_pem(b""),
            Err(ClientError::Tls(_))
        ));
    }
}
