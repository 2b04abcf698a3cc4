//! TLS configuration for servers and channels, backed by rustls.
//!
//! Only PEM inputs are accepted; ALPN is pinned to `h2`.

use std::sync::Arc;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::Error;

const ALPN_H2: &[u8] = b"h2";

/// A PEM-encoded certificate (or chain).
#[derive(Debug, Clone)]
pub struct Certificate {
    pem: Vec<u8>,
}

impl Certificate {
    pub fn from_pem(pem: impl AsRef<[u8]>) -> Certificate {
        Certificate {
            pem: pem.as_ref().to_vec(),
        }
    }

    fn certs(&self) -> Result<Vec<CertificateDer<'static>>, Error> {
        rustls_pemfile::certs(&mut &*self.pem)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| tls_error(format!("invalid certificate pem: {}", err)))
    }
}

/// A certificate paired with its private key.
#[derive(Debug, Clone)]
pub struct Identity {
    cert: Certificate,
    key: Vec<u8>,
}

impl Identity {
    pub fn from_pem(cert: impl AsRef<[u8]>, key: impl AsRef<[u8]>) -> Identity {
        Identity {
            cert: Certificate::from_pem(cert),
            key: key.as_ref().to_vec(),
        }
    }

    fn key(&self) -> Result<PrivateKeyDer<'static>, Error> {
        rustls_pemfile::private_key(&mut &*self.key)
            .map_err(|err| tls_error(format!("invalid private key pem: {}", err)))?
            .ok_or_else(|| tls_error("no private key found in pem".into()))
    }
}

/// Server-side TLS: an identity and, optionally, a client CA for mutual
/// auth.
#[derive(Debug, Clone, Default)]
pub struct ServerTlsConfig {
    identity: Option<Identity>,
    client_ca_root: Option<Certificate>,
}

impl ServerTlsConfig {
    pub fn new() -> ServerTlsConfig {
        ServerTlsConfig::default()
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Require client certificates signed by this root.
    pub fn client_ca_root(mut self, ca: Certificate) -> Self {
        self.client_ca_root = Some(ca);
        self
    }

    pub(crate) fn build_acceptor(&self) -> Result<TlsAcceptor, Error> {
        let identity = self
            .identity
            .as_ref()
            .ok_or_else(|| tls_error("server tls requires an identity".into()))?;

        let builder = ServerConfig::builder();
        let builder = match &self.client_ca_root {
            Some(ca) => {
                let mut roots = RootCertStore::empty();
                for cert in ca.certs()? {
                    roots
                        .add(cert)
                        .map_err(|err| tls_error(format!("invalid client ca: {}", err)))?;
                }
                let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
                    .build()
                    .map_err(|err| tls_error(format!("invalid client verifier: {}", err)))?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder
            .with_single_cert(identity.cert.certs()?, identity.key()?)
            .map_err(|err| tls_error(format!("invalid server identity: {}", err)))?;
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Client-side TLS: the root to trust, an optional identity for mutual
/// auth, and an optional domain override for certificate validation.
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    ca_certificate: Option<Certificate>,
    identity: Option<Identity>,
    domain: Option<String>,
}

impl ClientTlsConfig {
    pub fn new() -> ClientTlsConfig {
        ClientTlsConfig::default()
    }

    pub fn ca_certificate(mut self, ca: Certificate) -> Self {
        self.ca_certificate = Some(ca);
        self
    }

    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Validate the server certificate against this name instead of the
    /// connect host.
    pub fn domain_name(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub(crate) fn build_connector(
        &self,
        host: &str,
    ) -> Result<(TlsConnector, ServerName<'static>), Error> {
        let ca = self
            .ca_certificate
            .as_ref()
            .ok_or_else(|| tls_error("client tls requires a ca certificate".into()))?;

        let mut roots = RootCertStore::empty();
        for cert in ca.certs()? {
            roots
                .add(cert)
                .map_err(|err| tls_error(format!("invalid ca certificate: {}", err)))?;
        }

        let builder = ClientConfig::builder().with_root_certificates(roots);
        let mut config = match &self.identity {
            Some(identity) => builder
                .with_client_auth_cert(identity.cert.certs()?, identity.key()?)
                .map_err(|err| tls_error(format!("invalid client identity: {}", err)))?,
            None => builder.with_no_client_auth(),
        };
        config.alpn_protocols = vec![ALPN_H2.to_vec()];

        let domain = self.domain.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(domain.to_owned())
            .map_err(|_| tls_error(format!("invalid tls domain name {:?}", domain)))?;

        Ok((TlsConnector::from(Arc::new(config)), server_name))
    }
}

fn tls_error(message: String) -> Error {
    Error::Transport(message.into())
}
