use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use sandnet_gateway::tls::store::CertStore;

fn client_config(store: &CertStore) -> Arc<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.add(store.ca_cert_der()).unwrap();
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// A client that trusts only the store's CA completes a handshake against a
/// minted leaf — which proves the leaf chains to the CA and its SAN covers
/// the SNI.
#[tokio::test]
async fn minted_leaf_satisfies_webpki_for_its_sni() {
    let dir = tempfile::tempdir().unwrap();
    let store = CertStore::open(dir.path(), 16).unwrap();

    let server_config = store.server_config_for("evil.example.com").unwrap();
    let acceptor = TlsAcceptor::from(server_config);
    let connector = TlsConnector::from(client_config(&store));

    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let server = tokio::spawn(async move {
        let mut tls = acceptor.accept(server_io).await.unwrap();
        let mut buf = [0u8; 4];
        tls.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        tls.write_all(b"pong").await.unwrap();
        tls.shutdown().await.unwrap();
    });

    let name = ServerName::try_from("evil.example.com").unwrap();
    let mut tls = connector.connect(name, client_io).await.unwrap();
    tls.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    tls.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
    server.await.unwrap();
}

/// The apex is in the SAN set for subdomain SNIs, so a client validating
/// the apex name against the same leaf also succeeds.
#[tokio::test]
async fn subdomain_leaf_covers_the_apex() {
    let dir = tempfile::tempdir().unwrap();
    let store = CertStore::open(dir.path(), 16).unwrap();

    let server_config = store.server_config_for("api.github.com").unwrap();
    let acceptor = TlsAcceptor::from(server_config);
    let connector = TlsConnector::from(client_config(&store));

    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let server = tokio::spawn(async move {
        let _ = acceptor.accept(server_io).await;
    });

    let name = ServerName::try_from("github.com").unwrap();
    assert!(connector.connect(name, client_io).await.is_ok());
    server.await.unwrap();
}

/// A leaf minted for one SNI must not validate for an unrelated name.
#[tokio::test]
async fn leaf_is_rejected_for_other_names() {
    let dir = tempfile::tempdir().unwrap();
    let store = CertStore::open(dir.path(), 16).unwrap();

    let server_config = store.server_config_for("evil.example.com").unwrap();
    let acceptor = TlsAcceptor::from(server_config);
    let connector = TlsConnector::from(client_config(&store));

    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let server = tokio::spawn(async move {
        let _ = acceptor.accept(server_io).await;
    });

    let name = ServerName::try_from("api.github.com").unwrap();
    assert!(connector.connect(name, client_io).await.is_err());
    let _ = server.await;
}

#[tokio::test]
async fn leaves_are_cached_per_sni() {
    let dir = tempfile::tempdir().unwrap();
    let store = CertStore::open(dir.path(), 16).unwrap();

    let first = store.server_config_for("api.github.com").unwrap();
    let second = store.server_config_for("API.GITHUB.COM").unwrap();
    assert!(Arc::ptr_eq(&first, &second), "same SNI must hit the cache");

    let other = store.server_config_for("evil.example.com").unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
}

#[tokio::test]
async fn ca_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let first_pem = {
        let store = CertStore::open(dir.path(), 16).unwrap();
        store.ca_cert_pem().to_string()
    };
    let store = CertStore::open(dir.path(), 16).unwrap();
    assert_eq!(store.ca_cert_pem(), first_pem);
    assert!(dir.path().join("ca.cert.pem").exists());
    assert!(dir.path().join("ca.key.pem").exists());

    // Leaves minted after a restart still chain to the persisted CA.
    let server_config = store.server_config_for("api.github.com").unwrap();
    let acceptor = TlsAcceptor::from(server_config);
    let connector = TlsConnector::from(client_config(&store));
    let (client_io, server_io) = tokio::io::duplex(16 * 1024);
    let server = tokio::spawn(async move {
        let _ = acceptor.accept(server_io).await;
    });
    let name = ServerName::try_from("api.github.com").unwrap();
    assert!(connector.connect(name, client_io).await.is_ok());
    server.await.unwrap();
}
