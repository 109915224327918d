use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow, ensure};
use rustls::crypto::ring;
use rustls::{
    ServerConfig,
    pki_types::{CertificateDer, PrivateKeyDer},
};
use tokio_rustls::TlsAcceptor;

/// Builds the server-side acceptor shared by the ingress listeners and the
/// metrics endpoint.
pub fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;
    let provider = ring::default_provider();
    let mut config = ServerConfig::builder_with_provider(provider.into())
        .with_safe_default_protocol_versions()
        .map_err(|e| anyhow!("failed to select protocol versions: {e}"))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("failed to build server config: {e}"))?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read certs from {}", path.display()))?;
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(&data[..]))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| anyhow!("failed to parse certs from {}: {e}", path.display()))?;
    ensure!(!certs.is_empty(), "no certificates found in {}", path.display());
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read key from {}", path.display()))?;
    rustls_pemfile::private_key(&mut std::io::BufReader::new(&data[..]))
        .map_err(|e| anyhow!("failed to parse key from {}: {e}", path.display()))?
        .ok_or_else(|| anyhow!("no valid private key found in {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_cert_file_is_an_error() {
        let err = match build_acceptor(
            Path::new("/nonexistent/ig.crt"),
            Path::new("/nonexistent/ig.key"),
        ) {
            Err(e) => e,
            Ok(_) => panic!("must fail"),
        };
        assert!(
            err.to_string().contains("failed to read certs"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn pem_without_certificates_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cert_path = dir.path().join("empty.crt");
        let mut file = std::fs::File::create(&cert_path).expect("create cert file");
        file.write_all(b"not a pem block\n").expect("write cert file");

        let err = load_certs(&cert_path).expect_err("must fail");
        assert!(
            err.to_string().contains("no certificates found"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn key_file_without_key_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let key_path = dir.path().join("empty.key");
        let mut file = std::fs::File::create(&key_path).expect("create key file");
        file.write_all(b"not a pem block\n").expect("write key file");

        let err = load_key(&key_path).expect_err("must fail");
        assert!(
            err.to_string().contains("no valid private key"),
            "unexpected error: {err}"
        );
    }
}
