//! TLS material for the RPC listener.
//!
//! When TLS is enabled and no certificate exists, a self-signed ECDSA P-256
//! certificate is generated covering localhost and every non-loopback
//! interface IP, with the CA basic constraint set so clients can trust-anchor
//! it directly.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::info;

use crate::probe;

/// Load the certificate pair, generating a self-signed one when absent.
pub fn load_or_generate(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    if !cert_path.exists() || !key_path.exists() {
        info!(cert = %cert_path.display(), "TLS certificate missing, generating self-signed");
        generate_self_signed(cert_path, key_path)?;
    }
    build_acceptor(cert_path, key_path)
}

fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<()> {
    if let Some(dir) = cert_path.parent() {
        std::fs::create_dir_all(dir).context("creating tls directory")?;
    }

    let mut sans: Vec<String> = vec!["localhost".into(), "127.0.0.1".into(), "::1".into()];
    for ip in probe::non_loopback_ips() {
        sans.push(ip.to_string());
    }

    let mut params =
        rcgen::CertificateParams::new(sans).context("building certificate params")?;
    let mut dn = rcgen::DistinguishedName::new();
    dn.push(rcgen::DnType::OrganizationName, "Wardend Agent");
    dn.push(rcgen::DnType::CommonName, "wardend");
    params.distinguished_name = dn;
    // CA flag so clients can pin the certificate as a trust anchor.
    params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);

    let key_pair = rcgen::KeyPair::generate().context("generating P-256 key")?;
    let cert = params
        .self_signed(&key_pair)
        .context("self-signing certificate")?;

    use std::os::unix::fs::OpenOptionsExt;
    use std::io::Write;

    let mut cert_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(cert_path)
        .context("writing certificate")?;
    cert_file.write_all(cert.pem().as_bytes())?;

    let mut key_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(key_path)
        .context("writing private key")?;
    key_file.write_all(key_pair.serialize_pem().as_bytes())?;

    info!(cert = %cert_path.display(), key = %key_path.display(), "self-signed certificate generated");
    Ok(())
}

fn build_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let _ = tokio_rustls::rustls::crypto::ring::default_provider().install_default();

    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("reading certificate: {}", cert_path.display()))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("reading private key: {}", key_path.display()))?;

    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice())
            .collect::<std::io::Result<Vec<_>>>()
            .context("parsing certificate PEM")?;
    anyhow::ensure!(!certs.is_empty(), "no certificates in {}", cert_path.display());

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .context("parsing private key PEM")?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("building TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_loads_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");

        load_or_generate(&cert, &key).unwrap();
        assert!(cert.exists());
        assert!(key.exists());

        use std::os::unix::fs::PermissionsExt;
        let cert_mode = std::fs::metadata(&cert).unwrap().permissions().mode();
        let key_mode = std::fs::metadata(&key).unwrap().permissions().mode();
        assert_eq!(cert_mode & 0o777, 0o644);
        assert_eq!(key_mode & 0o777, 0o600);

        let cert_text = std::fs::read_to_string(&cert).unwrap();
        assert!(cert_text.contains("BEGIN CERTIFICATE"));
        let key_text = std::fs::read_to_string(&key).unwrap();
        assert!(key_text.contains("PRIVATE KEY"));
    }

    #[test]
    fn reuses_existing_certificate() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");

        load_or_generate(&cert, &key).unwrap();
        let first = std::fs::read(&cert).unwrap();
        load_or_generate(&cert, &key).unwrap();
        let second = std::fs::read(&cert).unwrap();
        assert_eq!(first, second);
    }
}
