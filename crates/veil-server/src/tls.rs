//! TLS configuration loading.

use tokio_rustls::rustls;
use tracing::info;

use veil_config::TlsConfig;

use crate::error::ServerError;

/// Build a rustls server config from certificate and key paths.
pub fn load_tls_config(cfg: &TlsConfig) -> Result<rustls::ServerConfig, ServerError> {
    let certs = load_certs(&cfg.cert)?;
    let key = load_private_key(&cfg.key)?;

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    if !cfg.alpn.is_empty() {
        config.alpn_protocols = cfg.alpn.iter().map(|s| s.as_bytes().to_vec()).collect();
    }

    info!(cert = %cfg.cert, alpn = ?cfg.alpn, "TLS configured");
    Ok(config)
}

/// Load certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>, ServerError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader)
        .filter_map(|c| c.ok().map(|v| v.into_owned()))
        .collect();
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &str) -> Result<rustls::pki_types::PrivateKeyDer<'static>, ServerError> {
    let mut reader = std::io::BufReader::new(std::fs::File::open(path)?);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => {
                return Ok(rustls::pki_types::PrivateKeyDer::Pkcs8(key));
            }
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => {
                return Ok(rustls::pki_types::PrivateKeyDer::Pkcs1(key));
            }
            Some(_) => continue,
            None => break,
        }
    }
    Err(ServerError::Config("no private key found".into()))
}
