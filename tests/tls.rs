mod common;

use std::time::Duration;

use common::{accept_all, until};
use lanlink::peer::ConnectionState;
use lanlink::{Client, ClientOptions, ClientTls, PeerError, Server, ServerOptions, ServerTls, TlsIdentity, TrustStore};

async fn tls_server(identity: &TlsIdentity, trust: &TrustStore, cert_sharing: bool) -> Server {
    let tls = ServerTls::new(identity.clone(), trust.clone())
        .require_client_auth(true)
        .cert_sharing(cert_sharing);
    let options = ServerOptions::new("srv", "127.0.0.1:0".parse().unwrap())
        .protocol("tls")
        .tls(tls);
    let server = Server::new(options, accept_all());
    server.startup().await.unwrap();
    server
}

fn client_options(server: &Server, identity: &TlsIdentity, trust: &TrustStore, cert_sharing: bool) -> ClientOptions {
    let mut tls = ClientTls::new(Some(identity.clone()), trust.clone()).with_cert_sharing(cert_sharing);
    tls.cert_sharing_timeout = Duration::from_secs(2);
    ClientOptions::new("cl", "srv", server.local_addr().unwrap())
        .protocol("tls")
        .tls(tls)
}

#[tokio::test]
async fn cert_sharing_bootstraps_mutual_trust() {
    let server_identity = TlsIdentity::generate(vec!["srv".into()]).unwrap();
    let client_identity = TlsIdentity::generate(vec!["cl".into()]).unwrap();
    let server_trust = TrustStore::new();
    let client_trust = TrustStore::new();

    let server = tls_server(&server_identity, &server_trust, true).await;

    let first = Client::connect_new(client_options(&server, &client_identity, &client_trust, true), accept_all())
        .await
        .unwrap();
    assert_eq!(first.state(), ConnectionState::Connected);
    assert_eq!(client_trust.get("srv").as_deref(), Some(server_identity.cert_der()));
    assert!(server_trust.contains_cert(client_identity.cert_der()));
    assert!(until(|| server.clients().len() == 1).await);

    first.send_text("over tls").await.unwrap();
    first.disconnect().await.unwrap();

    // trust is now established, no sharing needed
    let second = Client::connect_new(client_options(&server, &client_identity, &client_trust, false), accept_all())
        .await
        .unwrap();
    assert_eq!(second.state(), ConnectionState::Connected);
    assert_eq!(client_trust.len(), 1);

    second.disconnect().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn untrusted_server_without_sharing_fails() {
    let server_identity = TlsIdentity::generate(vec!["srv".into()]).unwrap();
    let client_identity = TlsIdentity::generate(vec!["cl".into()]).unwrap();
    let server = tls_server(&server_identity, &TrustStore::new(), false).await;

    let result = Client::connect_new(
        client_options(&server, &client_identity, &TrustStore::new(), false),
        accept_all(),
    )
    .await;
    assert!(matches!(result, Err(PeerError::Connection { .. })));
    assert!(server.clients().is_empty());
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn auto_trust_accepts_first_presentation() {
    let server_identity = TlsIdentity::generate(vec!["srv".into()]).unwrap();
    let client_identity = TlsIdentity::generate(vec!["cl".into()]).unwrap();
    let server_trust = TrustStore::new();
    server_trust.set_auto_add(true);
    let client_trust = TrustStore::new();
    client_trust.set_auto_add(true);

    let server = tls_server(&server_identity, &server_trust, false).await;
    let client = Client::connect_new(client_options(&server, &client_identity, &client_trust, false), accept_all())
        .await
        .unwrap();
    assert!(client_trust.contains_cert(server_identity.cert_der()));
    assert!(until(|| server_trust.contains_cert(client_identity.cert_der())).await);

    client.disconnect().await.unwrap();
    server.shutdown().await.unwrap();
}
