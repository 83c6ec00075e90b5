use std::fs;
use std::path::Path;

use tokio_native_tls::TlsAcceptor;
use tracing::info;
use wschat_core::{Error, Result};

/// Build a TLS acceptor from a PEM certificate chain and PKCS#8 PEM key.
pub fn load_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor> {
    let cert = fs::read(cert_file)?;
    let key = fs::read(key_file)?;

    let identity = native_tls::Identity::from_pkcs8(&cert, &key)
        .map_err(|e| Error::Config(format!("invalid TLS certificate or key: {}", e)))?;
    let acceptor = native_tls::TlsAcceptor::new(identity)
        .map_err(|e| Error::Config(format!("failed to build TLS acceptor: {}", e)))?;

    info!("Loaded TLS certificate from {}", cert_file.display());
    Ok(TlsAcceptor::from(acceptor))
}
