//! rustls integration.
//!
//! Builders that turn a [`CertBundle`] into rustls server and client
//! configurations, plus [`accept`], which wires the manager's server-side
//! hook into a tokio-rustls handshake: the client hello is parsed first, the
//! requested server name drives certificate selection, and only then is the
//! handshake completed.

use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{LazyConfigAcceptor, TlsAcceptor, TlsConnector};

use crate::certificate::CertBundle;
use crate::manager::CertManager;
use crate::{Error, Result};

/// Builder for a rustls server configuration backed by an issued bundle.
pub struct TlsServerConfig {
    bundle: Arc<CertBundle>,
}

impl TlsServerConfig {
    /// Creates a server config builder presenting `bundle`.
    pub fn new(bundle: Arc<CertBundle>) -> Self {
        Self { bundle }
    }

    /// Builds the rustls `ServerConfig`.
    pub fn build(self) -> Result<ServerConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let (chain, key) = split_bundle(&self.bundle)?;
        ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|e| Error::Tls(format!("failed to build server config: {e}")))
    }

    /// Builds a tokio-rustls acceptor.
    pub fn build_acceptor(self) -> Result<TlsAcceptor> {
        Ok(TlsAcceptor::from(Arc::new(self.build()?)))
    }
}

/// Builder for a rustls client configuration that presents the bundle as a
/// client certificate.
pub struct TlsClientConfig {
    bundle: Arc<CertBundle>,
    roots: Option<RootCertStore>,
}

impl TlsClientConfig {
    /// Creates a client config builder presenting `bundle`.
    pub fn new(bundle: Arc<CertBundle>) -> Self {
        Self {
            bundle,
            roots: None,
        }
    }

    /// Sets the roots used to verify the server. Defaults to the bundle's
    /// own issuing chain, which suits private CAs issuing both sides.
    pub fn with_roots(mut self, roots: RootCertStore) -> Self {
        self.roots = Some(roots);
        self
    }

    /// Builds the rustls `ClientConfig`.
    pub fn build(self) -> Result<ClientConfig> {
        let _ = rustls::crypto::ring::default_provider().install_default();

        let roots = match self.roots {
            Some(roots) => roots,
            None => {
                let mut roots = RootCertStore::empty();
                for cert in &self.bundle.chain()[1..] {
                    roots
                        .add(CertificateDer::from(cert.der().to_vec()))
                        .map_err(|e| Error::Tls(format!("failed to add root cert: {e}")))?;
                }
                roots
            }
        };

        let (chain, key) = split_bundle(&self.bundle)?;
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(chain, key)
            .map_err(|e| Error::Tls(format!("failed to build client config: {e}")))
    }

    /// Builds a tokio-rustls connector.
    pub fn build_connector(self) -> Result<TlsConnector> {
        Ok(TlsConnector::from(Arc::new(self.build()?)))
    }
}

/// Accepts one TLS connection, selecting the certificate from the client
/// hello's server name via the manager.
///
/// The handshake is paused after the client hello, the manager's server-side
/// hook runs (which may issue a new certificate), and the handshake then
/// completes with the selected bundle.
pub async fn accept<IO>(
    manager: &CertManager,
    stream: IO,
) -> Result<tokio_rustls::server::TlsStream<IO>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    let acceptor = LazyConfigAcceptor::new(rustls::server::Acceptor::default(), stream);
    let start = acceptor
        .await
        .map_err(|e| Error::Tls(format!("client hello failed: {e}")))?;

    let server_name = start
        .client_hello()
        .server_name()
        .map(str::to_string)
        .unwrap_or_default();
    let bundle = manager.select_server_certificate(&server_name).await?;

    let config = TlsServerConfig::new(bundle).build()?;
    start
        .into_stream(Arc::new(config))
        .await
        .map_err(|e| Error::Tls(format!("handshake failed: {e}")))
}

fn split_bundle(
    bundle: &CertBundle,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain = bundle
        .chain()
        .iter()
        .map(|c| CertificateDer::from(c.der().to_vec()))
        .collect();
    let key = PrivateKeyDer::try_from(bundle.private_key().to_pkcs8_der()?)
        .map_err(|e| Error::Tls(format!("invalid private key: {e}")))?;
    Ok((chain, key))
}
