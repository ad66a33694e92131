//! Full TLS handshake through the lazy acceptor: the server certificate is
//! issued on demand from the SNI in the client hello and verified by the
//! client against the test root.

mod support;

use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::RootCertStore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::TlsConnector;

use oncert::{CertManager, MemoryCache};
use support::TestCa;

#[tokio::test]
async fn handshake_issues_certificate_for_sni() {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let ca = Arc::new(TestCa::new(Duration::from_secs(24 * 60 * 60)));
    let root_pem = ca.root_pem().to_string();
    let issuer: Arc<dyn oncert::Issuer> = Arc::clone(&ca) as _;
    let manager =
        Arc::new(CertManager::new("myserver.com", issuer).with_cache(Arc::new(MemoryCache::new())));

    let (client_io, server_io) = tokio::io::duplex(16 * 1024);

    let server = tokio::spawn({
        let manager = Arc::clone(&manager);
        async move {
            let mut stream = oncert::tls::accept(&manager, server_io).await.unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").await.unwrap();
            stream.shutdown().await.ok();
        }
    });

    let mut roots = RootCertStore::empty();
    for cert in oncert::certificate::parse_chain_pem(&root_pem).unwrap() {
        roots
            .add(CertificateDer::from(cert.der().to_vec()))
            .unwrap();
    }
    let client_config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(client_config));

    let server_name = ServerName::try_from("myserver.com").unwrap();
    let mut stream = connector.connect(server_name, client_io).await.unwrap();
    stream.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    server.await.unwrap();
    assert_eq!(ca.calls(), 1);
}
