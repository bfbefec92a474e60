//! TLS utilities for loading certificates and configuring mutual TLS.
//!
//! Certificates are provisioned out of band as PEM files. The master
//! requires every worker to present a certificate signed by the shared CA;
//! workers verify the master against the same CA.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::crypto::{ring, CryptoProvider};
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    ServerName,
};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use x509_parser::prelude::{FromDer, X509Certificate};

use winlink_core::WorkerId;

use crate::error::TlsError;

/// Prefix of the certificate CN that binds a certificate to a worker id.
pub const WORKER_CN_PREFIX: &str = "worker:";

/// Paths to the PEM files that make up a node's TLS identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsPaths {
    pub ca_cert_path: PathBuf,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Loaded TLS materials: this node's chain and key, plus the trusted CA.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: Vec<CertificateDer<'static>>,
}

impl TlsIdentity {
    /// Load TLS materials from the configured file paths.
    pub async fn load(paths: &TlsPaths) -> Result<Self, TlsError> {
        let ca_pem = read_pem(&paths.ca_cert_path, TlsError::CaCertNotFound).await?;
        let cert_pem = read_pem(&paths.cert_path, TlsError::CertNotFound).await?;
        let key_pem = read_pem(&paths.key_path, TlsError::KeyNotFound).await?;
        Self::from_pem(&ca_pem, &cert_pem, &key_pem)
    }

    /// Build an identity from in-memory PEM data.
    pub fn from_pem(ca_pem: &[u8], cert_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsError> {
        let roots = parse_certs(ca_pem)?;
        let certs = parse_certs(cert_pem)?;
        let key = parse_key(key_pem)?;
        Ok(Self { certs, key, roots })
    }

    fn provider() -> Arc<CryptoProvider> {
        Arc::new(ring::default_provider())
    }

    fn root_store(&self) -> Result<RootCertStore, TlsError> {
        let mut store = RootCertStore::empty();
        for cert in &self.roots {
            store
                .add(cert.clone())
                .map_err(|e| TlsError::Config(e.to_string()))?;
        }
        Ok(store)
    }

    /// Server config that requires client certificates signed by the CA.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>, TlsError> {
        let provider = Self::provider();
        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(self.root_store()?), provider.clone())
                .build()
                .map_err(|e| TlsError::Config(e.to_string()))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| TlsError::Config(e.to_string()))?;

        Ok(Arc::new(config))
    }

    /// Client config that presents this node's certificate and trusts only the CA.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>, TlsError> {
        let config = ClientConfig::builder_with_provider(Self::provider())
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(e.to_string()))?
            .with_root_certificates(self.root_store()?)
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())
            .map_err(|e| TlsError::Config(e.to_string()))?;

        Ok(Arc::new(config))
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(self.server_config()?))
    }

    pub fn connector(&self) -> Result<TlsConnector, TlsError> {
        Ok(TlsConnector::from(self.client_config()?))
    }
}

async fn read_pem(path: &Path, missing: fn(PathBuf) -> TlsError) -> Result<Vec<u8>, TlsError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing(path.to_path_buf())),
        Err(e) => Err(TlsError::Io(e)),
    }
}

fn parse_certs(input: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs: Vec<_> = pem::parse_many(input)
        .map_err(|e| TlsError::Pem(e.to_string()))?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| CertificateDer::from(block.into_contents()))
        .collect();

    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

fn parse_key(input: &[u8]) -> Result<PrivateKeyDer<'static>, TlsError> {
    for block in pem::parse_many(input).map_err(|e| TlsError::Pem(e.to_string()))? {
        let key = match block.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(block.into_contents())),
            "RSA PRIVATE KEY" => {
                PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(block.into_contents()))
            }
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(block.into_contents())),
            _ => continue,
        };
        return Ok(key);
    }
    Err(TlsError::NoPrivateKey)
}

/// Parse the name a client should verify the master certificate against.
pub fn server_name(name: &str) -> Result<ServerName<'static>, TlsError> {
    ServerName::try_from(name.to_string()).map_err(|_| TlsError::InvalidServerName(name.to_string()))
}

/// Extract the worker id bound to a peer certificate.
///
/// Returns `None` if the certificate cannot be parsed or its Common Name
/// is not of the form `worker:<id>`.
pub fn worker_id_from_cert(cert_der: &[u8]) -> Option<WorkerId> {
    let (_, cert) = X509Certificate::from_der(cert_der).ok()?;
    let cn = cert.subject().iter_common_name().next()?.as_str().ok()?;
    let id = cn.strip_prefix(WORKER_CN_PREFIX)?;
    if id.is_empty() {
        return None;
    }
    Some(WorkerId::new(id))
}

/// Worker id bound to the first certificate of a verified peer chain.
pub fn peer_worker_id(chain: Option<&[CertificateDer<'_>]>) -> Option<WorkerId> {
    chain
        .and_then(|certs| certs.first())
        .and_then(|cert| worker_id_from_cert(cert.as_ref()))
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Throwaway CA and leaf certificates for tests.

    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    };

    pub struct TestPki {
        pub ca_pem: String,
        ca_cert: rcgen::Certificate,
        ca_key: KeyPair,
    }

    impl TestPki {
        pub fn new() -> Self {
            let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, "winlink test ca");
            params.distinguished_name = dn;
            let ca_key = KeyPair::generate().unwrap();
            let ca_cert = params.self_signed(&ca_key).unwrap();
            Self {
                ca_pem: ca_cert.pem(),
                ca_cert,
                ca_key,
            }
        }

        /// Issue a leaf certificate; returns (cert_pem, key_pem).
        pub fn issue(&self, common_name: &str, sans: &[&str]) -> (String, String) {
            let mut params =
                CertificateParams::new(sans.iter().map(|s| s.to_string()).collect::<Vec<_>>())
                    .unwrap();
            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, common_name);
            params.distinguished_name = dn;
            let key = KeyPair::generate().unwrap();
            let cert = params.signed_by(&key, &self.ca_cert, &self.ca_key).unwrap();
            (cert.pem(), key.serialize_pem())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::TestPki;
    use super::*;

    #[test]
    fn test_from_pem_builds_both_configs() {
        let pki = TestPki::new();
        let (cert, key) = pki.issue("master", &["localhost"]);
        let identity =
            TlsIdentity::from_pem(pki.ca_pem.as_bytes(), cert.as_bytes(), key.as_bytes()).unwrap();
        assert!(identity.server_config().is_ok());
        assert!(identity.client_config().is_ok());
    }

    #[test]
    fn test_missing_key_reported() {
        let pki = TestPki::new();
        let (cert, _) = pki.issue("master", &["localhost"]);
        let err = TlsIdentity::from_pem(pki.ca_pem.as_bytes(), cert.as_bytes(), cert.as_bytes());
        assert!(matches!(err, Err(TlsError::NoPrivateKey)));
    }

    #[test]
    fn test_missing_cert_reported() {
        let err = parse_certs(b"");
        assert!(matches!(err, Err(TlsError::NoCertificates)));
    }

    #[tokio::test]
    async fn test_load_missing_files() {
        let paths = TlsPaths {
            ca_cert_path: PathBuf::from("/nonexistent/ca.pem"),
            cert_path: PathBuf::from("/nonexistent/cert.pem"),
            key_path: PathBuf::from("/nonexistent/key.pem"),
        };
        let result = TlsIdentity::load(&paths).await;
        assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
    }

    #[test]
    fn test_worker_id_from_cert() {
        let pki = TestPki::new();
        let (cert_pem, _) = pki.issue("worker:test-worker-123", &[]);
        let der = pem::parse(cert_pem).unwrap().into_contents();
        assert_eq!(
            worker_id_from_cert(&der),
            Some(WorkerId::new("test-worker-123"))
        );

        let (other_pem, _) = pki.issue("not-a-worker", &[]);
        let der = pem::parse(other_pem).unwrap().into_contents();
        assert_eq!(worker_id_from_cert(&der), None);

        let (empty_pem, _) = pki.issue("worker:", &[]);
        let der = pem::parse(empty_pem).unwrap().into_contents();
        assert_eq!(worker_id_from_cert(&der), None);
    }

    #[test]
    fn test_server_name() {
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
        assert!(server_name("not a name").is_err());
    }
}
