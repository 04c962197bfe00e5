mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{accept_all, until, Recorder};
use lanlink::peer::{ConnectionState, DataProcessor, DisconnectionReason, Peer};
use lanlink::{ByeMsgConfig, Client, ClientOptions, HeartBeatConfig, PeerConfig, Server, ServerOptions};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

fn fast_config(bye: bool) -> PeerConfig {
    let mut config = PeerConfig::default();
    config.heartbeat = HeartBeatConfig::new(Duration::from_millis(200), Duration::from_millis(100), true);
    if !bye {
        config.bye = ByeMsgConfig::disabled();
    }
    config
}

async fn server(config: PeerConfig, processor: Arc<dyn DataProcessor>) -> Server {
    let options = ServerOptions::new("srv", "127.0.0.1:0".parse().unwrap()).config(config);
    let server = Server::new(options, processor);
    server.startup().await.unwrap();
    server
}

async fn single_client(server: &Server) -> Peer {
    assert!(until(|| server.clients().len() == 1).await);
    server.clients().remove(0)
}

#[tokio::test]
async fn bye_gives_local_and_remote_request() {
    let server = server(fast_config(true), accept_all()).await;
    let addr = server.local_addr().unwrap();

    let options = ClientOptions::new("cl", "srv", addr).config(fast_config(true));
    let client = Client::connect_new(options, accept_all()).await.unwrap();
    let server_peer = single_client(&server).await;

    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(server_peer.state(), ConnectionState::Connected);
    assert_eq!(client.disconnection_reason(), DisconnectionReason::NotDisconnected);
    assert_eq!(server_peer.disconnection_reason(), DisconnectionReason::NotDisconnected);

    client.disconnect().await.unwrap();
    let both_closed = async {
        client.closed().await;
        server_peer.closed().await;
    };
    assert!(tokio::time::timeout(Duration::from_millis(300), both_closed).await.is_ok());
    assert_eq!(client.disconnection_reason(), DisconnectionReason::LocalRequest);
    assert_eq!(server_peer.disconnection_reason(), DisconnectionReason::RemoteRequest);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn without_bye_the_remote_sees_connection_lost() {
    let server = server(fast_config(false), accept_all()).await;
    let addr = server.local_addr().unwrap();

    let options = ClientOptions::new("cl", "srv", addr).config(fast_config(false));
    let client = Client::connect_new(options, accept_all()).await.unwrap();
    let server_peer = single_client(&server).await;

    client.disconnect().await.unwrap();
    server_peer.closed().await;
    assert_eq!(client.disconnection_reason(), DisconnectionReason::LocalRequest);
    assert_eq!(server_peer.disconnection_reason(), DisconnectionReason::ConnectionLost);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn killed_client_is_connection_lost() {
    let server = server(fast_config(false), accept_all()).await;
    let socket = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    let server_peer = single_client(&server).await;
    let recorder = Recorder::new();
    server_peer.add_connection_listener(recorder.clone());

    drop(socket);
    assert!(tokio::time::timeout(Duration::from_secs(2), server_peer.closed()).await.is_ok());
    assert_eq!(server_peer.disconnection_reason(), DisconnectionReason::ConnectionLost);
    assert_eq!(recorder.count("disconnect ConnectionLost"), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn silent_remote_times_out_exactly_once() {
    let server = server(fast_config(true), accept_all()).await;
    // a raw socket never answers heartbeat requests
    let _socket = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    let server_peer = single_client(&server).await;
    let recorder = Recorder::new();
    server_peer.add_connection_listener(recorder.clone());

    assert!(tokio::time::timeout(Duration::from_secs(2), server_peer.closed()).await.is_ok());
    assert_eq!(server_peer.disconnection_reason(), DisconnectionReason::HeartbeatTimeout);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        recorder.events().iter().filter(|e| e.starts_with("disconnect")).count(),
        1
    );
    assert_eq!(recorder.count("disconnect HeartbeatTimeout"), 1);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn answered_heartbeats_keep_the_connection() {
    let server = server(fast_config(true), accept_all()).await;
    let options = ClientOptions::new("cl", "srv", server.local_addr().unwrap()).config(fast_config(true));
    let client = Client::connect_new(options, accept_all()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.disconnection_reason(), DisconnectionReason::NotDisconnected);

    client.disconnect().await.unwrap();
    server.shutdown().await.unwrap();
}

struct Frames(Mutex<Vec<String>>);

impl DataProcessor for Frames {
    fn process_text(&self, _peer: &Peer, data: &str) -> bool {
        self.0.lock().push(data.to_string());
        true
    }
}

#[tokio::test]
async fn frames_survive_arbitrary_fragmentation() {
    let frames = Arc::new(Frames(Mutex::new(Vec::new())));
    let server = server(PeerConfig::default(), frames.clone()).await;
    let mut socket = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
    socket.set_nodelay(true).unwrap();

    let payload = "hello\nwörld\nlast one\n".as_bytes();
    for chunk in payload.chunks(3) {
        socket.write_all(chunk).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(until(|| frames.0.lock().len() == 3).await);
    assert_eq!(*frames.0.lock(), vec!["hello", "wörld", "last one"]);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn client_and_server_exchange_frames() {
    let frames = Arc::new(Frames(Mutex::new(Vec::new())));
    let server = server(PeerConfig::default(), frames.clone()).await;

    let recorder = Recorder::new();
    let client = Client::new(
        ClientOptions::new("cl", "srv", server.local_addr().unwrap()),
        accept_all(),
    );
    client.add_connection_listener(recorder.clone());
    client.add_data_listener(recorder.clone());
    client.connect().await.unwrap();
    assert!(until(|| recorder.count("connect") == 1).await);

    client.send_text("ping").await.unwrap();
    client.send_data(b"raw").await.unwrap();
    assert!(until(|| frames.0.lock().len() == 2).await);

    let server_peer = single_client(&server).await;
    server_peer.send_text("pong").await.unwrap();
    assert!(until(|| recorder.received() == vec!["pong"]).await);

    let stats = client.stats();
    assert_eq!(stats.frames_tx, 2);
    assert!(stats.last_connection.is_some());
    assert_eq!(client.connection_info().remote_addr, server.local_addr());

    client.disconnect().await.unwrap();
    server.shutdown().await.unwrap();
}
