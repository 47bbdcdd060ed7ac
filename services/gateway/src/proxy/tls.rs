//! TLS material for listeners and upstream connections.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use edgeway_resources::{BackendTlsPolicySpec, CertificateRef};

use crate::error::BuildError;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";

fn open(path: &Path) -> Result<BufReader<File>, BuildError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BuildError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(BuildError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, BuildError> {
    let mut reader = open(path)?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| BuildError::Io {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| BuildError::Tls(format!("no private key found in {}", path.display())))
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server config for a terminating listener. ALPN offers h2 and http/1.1.
pub fn server_config(certificate: &CertificateRef) -> Result<Arc<ServerConfig>, BuildError> {
    let certs = load_certs(Path::new(&certificate.cert_path))?;
    let key = load_private_key(Path::new(&certificate.key_path))?;

    let mut config = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()];
    Ok(Arc::new(config))
}

/// Client TLS settings for one backend, from a BackendTLSPolicy.
#[derive(Clone)]
pub struct UpstreamTls {
    http1: Arc<ClientConfig>,
    h2: Arc<ClientConfig>,
    server_name: Option<ServerName<'static>>,
}

impl UpstreamTls {
    /// Build client configs. A CA bundle is required; the client certificate
    /// is optional and enables mutual TLS.
    pub fn from_policy(spec: &BackendTlsPolicySpec) -> Result<Self, BuildError> {
        let validation = spec.validation.clone().unwrap_or_default();
        let ca_path = validation.ca_cert_path.ok_or_else(|| {
            BuildError::Tls("validation.caCertPath is required for upstream TLS".to_string())
        })?;

        let mut roots = RootCertStore::empty();
        for cert in load_certs(Path::new(&ca_path))? {
            roots.add(cert)?;
        }

        let builder = ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots);
        let base = match &spec.client_certificate {
            Some(identity) => builder.with_client_auth_cert(
                load_certs(Path::new(&identity.cert_path))?,
                load_private_key(Path::new(&identity.key_path))?,
            )?,
            None => builder.with_no_client_auth(),
        };

        let mut http1 = base.clone();
        http1.alpn_protocols = vec![ALPN_HTTP11.to_vec()];
        let mut h2 = base;
        h2.alpn_protocols = vec![ALPN_H2.to_vec()];

        let server_name = validation
            .hostname
            .map(|name| {
                ServerName::try_from(name.clone())
                    .map_err(|_| BuildError::Tls(format!("invalid hostname {name:?}")))
            })
            .transpose()?;

        Ok(Self {
            http1: Arc::new(http1),
            h2: Arc::new(h2),
            server_name,
        })
    }

    /// Name sent as SNI and verified against the certificate: the policy
    /// override, else the target address.
    pub fn server_name(&self, address: &str) -> std::io::Result<ServerName<'static>> {
        if let Some(name) = &self.server_name {
            return Ok(name.clone());
        }
        ServerName::try_from(address.to_string())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
    }

    /// Run the client handshake over an established stream.
    pub async fn connect<IO>(&self, stream: IO, address: &str, h2: bool) -> std::io::Result<TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let config = if h2 { &self.h2 } else { &self.http1 };
        let name = self.server_name(address)?;
        TlsConnector::from(Arc::clone(config)).connect(name, stream).await
    }
}

impl std::fmt::Debug for UpstreamTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgeway_resources::TlsValidationSpec;
    use std::io::Write;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_rustls::TlsAcceptor;

    struct Fixture {
        _dir: tempfile::TempDir,
        cert: CertificateRef,
    }

    fn fixture() -> Fixture {
        let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let cert_path = dir.path().join("cert.pem");
        let key_path = dir.path().join("key.pem");
        File::create(&cert_path)
            .unwrap()
            .write_all(certified.cert.pem().as_bytes())
            .unwrap();
        File::create(&key_path)
            .unwrap()
            .write_all(certified.key_pair.serialize_pem().as_bytes())
            .unwrap();
        Fixture {
            cert: CertificateRef {
                cert_path: cert_path.display().to_string(),
                key_path: key_path.display().to_string(),
            },
            _dir: dir,
        }
    }

    #[test]
    fn test_missing_files_are_io_errors() {
        match load_certs(Path::new("/nonexistent/cert.pem")) {
            Err(BuildError::Io { path, .. }) => assert_eq!(path, Path::new("/nonexistent/cert.pem")),
            other => panic!("Expected Io error, got {:?}", other),
        }
    }

    #[test]
    fn test_upstream_requires_ca() {
        let spec = BackendTlsPolicySpec {
            target_refs: vec![],
            validation: None,
            client_certificate: None,
        };
        match UpstreamTls::from_policy(&spec) {
            Err(BuildError::Tls(reason)) => assert!(reason.contains("caCertPath")),
            other => panic!("Expected Tls error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminate_and_originate_handshake() {
        let fixture = fixture();
        let server = server_config(&fixture.cert).unwrap();
        let upstream = UpstreamTls::from_policy(&BackendTlsPolicySpec {
            target_refs: vec![],
            validation: Some(TlsValidationSpec {
                ca_cert_path: Some(fixture.cert.cert_path.clone()),
                hostname: Some("localhost".to_string()),
            }),
            client_certificate: None,
        })
        .unwrap();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let acceptor = TlsAcceptor::from(server);
        let server_task = tokio::spawn(async move {
            let mut stream = acceptor.accept(server_io).await.unwrap();
            let negotiated = stream.get_ref().1.alpn_protocol().map(|p| p.to_vec());
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
            stream.flush().await.unwrap();
            negotiated
        });

        let mut client = upstream.connect(client_io, "127.0.0.1", true).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(server_task.await.unwrap(), Some(ALPN_H2.to_vec()));
    }
}
