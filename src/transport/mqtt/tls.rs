//! Trust material for mutual-TLS broker connections
//!
//! Reads the CA bundle and the client certificate/key pair from PEM files and turns
//! them into a `rustls` client configuration for `rumqttc`. Server verification is on
//! unless the caller explicitly opts out with [`ServerVerification::InsecureSkipVerify`].

use crate::config::ConnectionConfig;
use crate::error::TlsConfigError;
use rumqttc::tokio_rustls::rustls;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// How the broker's certificate is checked during the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerVerification {
    /// Verify the server chain against the configured CA certificates
    Verify,
    /// Accept any server certificate (handshake signatures are still checked)
    InsecureSkipVerify,
}

impl ServerVerification {
    pub fn from_config(config: &ConnectionConfig) -> Self {
        if config.insecure_skip_verify {
            ServerVerification::InsecureSkipVerify
        } else {
            ServerVerification::Verify
        }
    }
}

/// CA trust anchors plus the client identity, loaded once per connection attempt
pub struct TrustMaterial {
    roots: RootCertStore,
    client_chain: Vec<CertificateDer<'static>>,
    client_key: PrivateKeyDer<'static>,
}

impl std::fmt::Debug for TrustMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustMaterial")
            .field("ca_certificates", &self.roots.len())
            .field("client_chain", &self.client_chain.len())
            .finish_non_exhaustive()
    }
}

impl TrustMaterial {
    /// Number of CA certificates in the trust store
    pub fn ca_count(&self) -> usize {
        self.roots.len()
    }

    /// Number of certificates in the client chain
    pub fn client_chain_len(&self) -> usize {
        self.client_chain.len()
    }

    /// Build the `rustls` client configuration presenting the client identity
    pub fn into_client_config(
        self,
        verification: ServerVerification,
    ) -> Result<ClientConfig, TlsConfigError> {
        let builder = ClientConfig::builder();
        let config = match verification {
            ServerVerification::Verify => builder
                .with_root_certificates(self.roots)
                .with_client_auth_cert(self.client_chain, self.client_key),
            ServerVerification::InsecureSkipVerify => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
                .with_client_auth_cert(self.client_chain, self.client_key),
        };

        config.map_err(TlsConfigError::InvalidClientIdentity)
    }
}

/// Load trust material from the TLS paths in `config`
pub fn trust_material_from_config(
    config: &ConnectionConfig,
) -> Result<TrustMaterial, TlsConfigError> {
    let ca = required_path(config.ca_file.as_ref(), "ca_file")?;
    let crt = required_path(config.crt_file.as_ref(), "crt_file")?;
    let key = required_path(config.key_file.as_ref(), "key_file")?;
    build_trust_material(ca, crt, key)
}

/// Build the `rustls` client configuration for `config`, logging when the server
/// certificate will not be verified
pub fn client_config_from_config(
    config: &ConnectionConfig,
) -> Result<ClientConfig, TlsConfigError> {
    let material = trust_material_from_config(config)?;
    let verification = ServerVerification::from_config(config);
    if verification == ServerVerification::InsecureSkipVerify {
        warn!(
            host = %config.host,
            "Server certificate verification is DISABLED for this connection"
        );
    }
    material.into_client_config(verification)
}

fn required_path<'a>(
    path: Option<&'a PathBuf>,
    name: &'static str,
) -> Result<&'a Path, TlsConfigError> {
    match path {
        Some(p) if !p.as_os_str().is_empty() => Ok(p.as_path()),
        _ => Err(TlsConfigError::MissingPath(name)),
    }
}

/// Read the CA bundle and client identity from PEM files
pub fn build_trust_material(
    ca_path: &Path,
    cert_path: &Path,
    key_path: &Path,
) -> Result<TrustMaterial, TlsConfigError> {
    let ca_certs = read_certificates(ca_path, "CA certificate")?;
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .map_err(|source| TlsConfigError::InvalidCaCertificate {
                path: ca_path.to_path_buf(),
                source,
            })?;
    }

    let client_chain = read_certificates(cert_path, "client certificate")?;
    let client_key = read_private_key(key_path)?;

    debug!(
        ca_certificates = roots.len(),
        client_chain = client_chain.len(),
        "Loaded TLS trust material"
    );

    Ok(TrustMaterial {
        roots,
        client_chain,
        client_key,
    })
}

fn open_pem(path: &Path, kind: &'static str) -> Result<BufReader<File>, TlsConfigError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsConfigError::Read {
            kind,
            path: path.to_path_buf(),
            source,
        })
}

fn read_certificates(
    path: &Path,
    kind: &'static str,
) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let mut reader = open_pem(path, kind)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates(path.to_path_buf()));
    }
    Ok(certs)
}

fn read_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let mut reader = open_pem(path, "client private key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| TlsConfigError::NoPrivateKey(path.to_path_buf()))
}

/// Verifier that trusts any server certificate chain
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const CA_PEM: &str = include_str!("../../../tests/fixtures/ca.pem");
    const CLIENT_CRT_PEM: &str = include_str!("../../../tests/fixtures/client.crt");
    const CLIENT_KEY_PEM: &str = include_str!("../../../tests/fixtures/client.key");

    fn pem_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_build_trust_material_from_valid_files() {
        let ca = pem_file(CA_PEM);
        let crt = pem_file(CLIENT_CRT_PEM);
        let key = pem_file(CLIENT_KEY_PEM);

        let material = build_trust_material(ca.path(), crt.path(), key.path()).unwrap();
        assert_eq!(material.ca_count(), 1);
        assert_eq!(material.client_chain_len(), 1);
    }

    #[test]
    fn test_client_config_in_both_verification_modes() {
        let ca = pem_file(CA_PEM);
        let crt = pem_file(CLIENT_CRT_PEM);
        let key = pem_file(CLIENT_KEY_PEM);

        for verification in [
            ServerVerification::Verify,
            ServerVerification::InsecureSkipVerify,
        ] {
            let material = build_trust_material(ca.path(), crt.path(), key.path()).unwrap();
            let config = material.into_client_config(verification);
            assert!(config.is_ok(), "{verification:?} should build");
        }
    }

    #[test]
    fn test_missing_ca_file() {
        let crt = pem_file(CLIENT_CRT_PEM);
        let key = pem_file(CLIENT_KEY_PEM);

        let result = build_trust_material(
            Path::new("/nonexistent/eventbus/ca.pem"),
            crt.path(),
            key.path(),
        );
        assert!(matches!(
            result,
            Err(TlsConfigError::Read {
                kind: "CA certificate",
                ..
            })
        ));
    }

    #[test]
    fn test_ca_file_without_certificates() {
        let ca = pem_file("this is not a certificate\n");
        let crt = pem_file(CLIENT_CRT_PEM);
        let key = pem_file(CLIENT_KEY_PEM);

        let result = build_trust_material(ca.path(), crt.path(), key.path());
        assert!(matches!(result, Err(TlsConfigError::NoCertificates(_))));
    }

    #[test]
    fn test_key_file_without_private_key() {
        let ca = pem_file(CA_PEM);
        let crt = pem_file(CLIENT_CRT_PEM);
        let key = pem_file(CLIENT_CRT_PEM);

        let result = build_trust_material(ca.path(), crt.path(), key.path());
        assert!(matches!(result, Err(TlsConfigError::NoPrivateKey(_))));
    }

    #[test]
    fn test_missing_client_key_file() {
        let ca = pem_file(CA_PEM);
        let crt = pem_file(CLIENT_CRT_PEM);

        let result = build_trust_material(
            ca.path(),
            crt.path(),
            Path::new("/nonexistent/eventbus/client.key"),
        );
        assert!(matches!(
            result,
            Err(TlsConfigError::Read {
                kind: "client private key",
                ..
            })
        ));
    }

    #[test]
    fn test_config_without_paths() {
        let mut config = ConnectionConfig::new("localhost", 8883);
        config.use_tls = true;

        let result = trust_material_from_config(&config);
        assert!(matches!(result, Err(TlsConfigError::MissingPath("ca_file"))));
    }

    #[test]
    fn test_server_verification_from_config() {
        let mut config = ConnectionConfig::new("localhost", 8883);
        assert_eq!(
            ServerVerification::from_config(&config),
            ServerVerification::Verify
        );

        config.insecure_skip_verify = true;
        assert_eq!(
            ServerVerification::from_config(&config),
            ServerVerification::InsecureSkipVerify
        );
    }
}
