//! TLS settings for broker connections: custom CA bundles and client
//! certificates for mTLS.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::debug;

use crate::config::SecurityConfig;
use crate::error::KafkaError;
use crate::Result;

/// Build a rustls client config from the security section of a context.
///
/// Without `ssl_ca_location` the public webpki roots are trusted. Client
/// authentication needs both the certificate and the key.
pub fn build_tls_config(security: &SecurityConfig) -> Result<ClientConfig> {
    let root_store = build_root_store(security.ssl_ca_location.as_deref())?;
    let builder = ClientConfig::builder().with_root_certificates(root_store);

    match (
        security.ssl_certificate_location.as_deref(),
        security.ssl_key_location.as_deref(),
    ) {
        (Some(cert_path), Some(key_path)) => {
            debug!(
                "Configuring mTLS with cert={}, key={}",
                cert_path.display(),
                key_path.display()
            );
            let certs = load_certificates(cert_path)?;
            let key = load_private_key(key_path)?;
            builder.with_client_auth_cert(certs, key).map_err(|e| {
                KafkaError::TlsConfig(format!("Failed to configure client authentication: {}", e))
                    .into()
            })
        }
        (Some(cert_path), None) => Err(KafkaError::TlsConfig(format!(
            "ssl_certificate_location ({}) requires ssl_key_location",
            cert_path.display()
        ))
        .into()),
        (None, Some(key_path)) => Err(KafkaError::TlsConfig(format!(
            "ssl_key_location ({}) requires ssl_certificate_location",
            key_path.display()
        ))
        .into()),
        (None, None) => Ok(builder.with_no_client_auth()),
    }
}

fn build_root_store(ca_path: Option<&Path>) -> Result<RootCertStore> {
    let Some(path) = ca_path else {
        debug!("Using webpki-roots for TLS verification");
        return Ok(RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        });
    };

    let mut root_store = RootCertStore::empty();
    for cert in load_certificates(path)? {
        root_store
            .add(cert)
            .map_err(|e| cert_error(path, format!("Invalid CA certificate: {}", e)))?;
    }
    debug!(
        "Loaded {} CA certificate(s) from {}",
        root_store.len(),
        path.display()
    );
    Ok(root_store)
}

fn open_pem(path: &Path) -> std::io::Result<BufReader<File>> {
    File::open(path).map(BufReader::new)
}

fn cert_error(path: &Path, message: String) -> KafkaError {
    KafkaError::CertificateLoad {
        path: path.display().to_string(),
        message,
    }
}

fn load_certificates(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader =
        open_pem(path).map_err(|e| cert_error(path, format!("Failed to open file: {}", e)))?;

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| cert_error(path, format!("Failed to parse PEM certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(cert_error(path, "No certificates found in file".to_string()).into());
    }
    Ok(certs)
}

/// Accepts PKCS#1, PKCS#8 and SEC1 keys; the first key in the file wins.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let key_error = |message: String| KafkaError::PrivateKeyLoad {
        path: path.display().to_string(),
        message,
    };

    let mut reader =
        open_pem(path).map_err(|e| key_error(format!("Failed to open file: {}", e)))?;

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| key_error(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| key_error("No private key found in file".to_string()).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_webpki_fallback() {
        let store = build_root_store(None).unwrap();
        assert!(!store.is_empty());
    }

    #[test]
    fn test_missing_ca_file() {
        let err = build_root_store(Some(Path::new("/nonexistent/ca.pem")))
            .unwrap_err()
            .to_string();
        assert!(err.contains("Failed to open file"), "{}", err);
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "not a certificate\n").unwrap();

        let err = build_root_store(Some(&path)).unwrap_err().to_string();
        assert!(err.contains("No certificates"), "{}", err);
    }

    #[test]
    fn test_key_file_without_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key.pem");
        std::fs::write(&path, "").unwrap();

        let err = load_private_key(&path).unwrap_err().to_string();
        assert!(err.contains("No private key"), "{}", err);
    }

    #[test]
    fn test_mtls_requires_cert_and_key() {
        let cert_only = SecurityConfig {
            ssl_certificate_location: Some(PathBuf::from("/path/to/cert.pem")),
            ..Default::default()
        };
        let err = build_tls_config(&cert_only).unwrap_err().to_string();
        assert!(err.contains("ssl_key_location"), "{}", err);

        let key_only = SecurityConfig {
            ssl_key_location: Some(PathBuf::from("/path/to/key.pem")),
            ..Default::default()
        };
        let err = build_tls_config(&key_only).unwrap_err().to_string();
        assert!(err.contains("ssl_certificate_location"), "{}", err);
    }

    #[test]
    fn test_no_client_auth_succeeds() {
        assert!(build_tls_config(&SecurityConfig::default()).is_ok());
    }
}
