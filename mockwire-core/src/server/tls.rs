//! TLS listener configuration: server identity, optional client
//! verification (mTLS), ALPN for HTTP/2.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::TlsAcceptor;

use crate::config::GrpcSettings;
use crate::error::{MockwireError, Result};

/// Build a TLS acceptor from the configured certificate material.
///
/// CA presence plus the require-client-cert flag determine mTLS: with a CA
/// and the flag set, client certificates are mandatory; with a CA alone
/// they are verified when offered.
pub fn build_acceptor(settings: &GrpcSettings) -> Result<TlsAcceptor> {
    let cert_path = settings
        .tls_cert_path
        .as_deref()
        .ok_or_else(|| MockwireError::Tls("TLS enabled but no certificate path set".into()))?;
    let key_path = settings
        .tls_key_path
        .as_deref()
        .ok_or_else(|| MockwireError::Tls("TLS enabled but no key path set".into()))?;

    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let builder = rustls::ServerConfig::builder();
    let mut config = match settings.tls_ca_path.as_deref() {
        Some(ca_path) => {
            let mut roots = RootCertStore::empty();
            for cert in load_certs(ca_path)? {
                roots
                    .add(cert)
                    .map_err(|e| MockwireError::Tls(format!("invalid CA certificate: {e}")))?;
            }
            let verifier_builder = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if settings.require_client_cert {
                verifier_builder.build()
            } else {
                verifier_builder.allow_unauthenticated().build()
            }
            .map_err(|e| MockwireError::Tls(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| MockwireError::Tls(format!("invalid server certificate/key: {e}")))?;

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| MockwireError::Tls(format!("failed to read certificate '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    let certs: std::result::Result<Vec<_>, _> = rustls_pemfile::certs(&mut reader).collect();
    let certs =
        certs.map_err(|e| MockwireError::Tls(format!("invalid PEM in '{path}': {e}")))?;
    if certs.is_empty() {
        return Err(MockwireError::Tls(format!(
            "no certificates found in '{path}'"
        )));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let file = File::open(path)
        .map_err(|e| MockwireError::Tls(format!("failed to read key '{path}': {e}")))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| MockwireError::Tls(format!("invalid PEM in '{path}': {e}")))?
        .ok_or_else(|| MockwireError::Tls(format!("no private key found in '{path}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(cert: Option<&str>, key: Option<&str>) -> GrpcSettings {
        GrpcSettings {
            plaintext_port: 0,
            tls_port: 0,
            tls_enabled: true,
            tls_cert_path: cert.map(String::from),
            tls_key_path: key.map(String::from),
            tls_ca_path: None,
            require_client_cert: false,
        }
    }

    #[test]
    fn missing_paths_are_tls_errors() {
        let err = match build_acceptor(&settings(None, None)) {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, MockwireError::Tls(_)));

        let err = match build_acceptor(&settings(Some("/no/such/cert.pem"), Some("/no/such/key.pem")))
        {
            Err(e) => e,
            Ok(_) => panic!("expected error"),
        };
        assert!(matches!(err, MockwireError::Tls(_)));
    }

    #[test]
    fn garbage_pem_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("cert.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "not a certificate").unwrap();
        std::fs::write(&key, "not a key").unwrap();

        let result = build_acceptor(&settings(
            cert.to_str().map(|s| s.to_string()).as_deref(),
            key.to_str().map(|s| s.to_string()).as_deref(),
        ));
        assert!(result.is_err());
    }
}
