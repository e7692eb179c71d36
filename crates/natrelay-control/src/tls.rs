//! TLS acceptor for the control and HTTPS listeners

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("No certificate found in {0}")]
    NoCertificates(String),

    #[error("No private key found in {0}")]
    NoPrivateKey(String),

    #[error("Invalid cert/key: {0}")]
    Rustls(#[from] rustls::Error),
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

/// Build an acceptor from PEM certificate chain and private key files
pub fn load_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, TlsError> {
    let open = |path: &Path| {
        File::open(path).map(BufReader::new).map_err(|source| TlsError::Io {
            path: path.display().to_string(),
            source,
        })
    };

    let certs = load_certs(&mut open(cert_path)?, &cert_path.display().to_string())?;
    let key = load_private_key(&mut open(key_path)?, &key_path.display().to_string())?;
    build_tls_acceptor(certs, key)
}

/// Build an acceptor from in-memory PEM
pub fn tls_acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, TlsError> {
    let certs = load_certs(&mut &cert_pem[..], "certificate PEM")?;
    let key = load_private_key(&mut &key_pem[..], "key PEM")?;
    build_tls_acceptor(certs, key)
}

fn build_tls_acceptor(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor, TlsError> {
    ensure_crypto_provider();

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(
    reader: &mut dyn BufRead,
    source: &str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Io {
            path: source.to_string(),
            source: e,
        })?;

    if certs.is_empty() {
        return Err(TlsError::NoCertificates(source.to_string()));
    }
    Ok(certs)
}

fn load_private_key(
    reader: &mut dyn BufRead,
    source: &str,
) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(reader)
        .map_err(|e| TlsError::Io {
            path: source.to_string(),
            source: e,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(source.to_string()))
}
