//! Accept loop producing one server-side [`Peer`] per inbound connection.
//!
//! Each accepted client starts from the server's current defaults. Later
//! changes to the heartbeat and bye defaults are broadcast as
//! `(previous, new)` pairs; a client adopts each field only if it still has
//! the previous default for it.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bye::ByeMsgConfig;
use crate::certsharing::{sharing_port, CertSharingServer};
use crate::config::{PeerConfig, DEFAULT_CERT_SHARING_TIMEOUT};
use crate::encoding::DataEncoding;
use crate::error::ServerError;
use crate::heartbeat::HeartBeatConfig;
use crate::listeners::{ListenerId, Listeners};
use crate::peer::{DataProcessor, Peer, PeerConnectionListener, PeerDataListener};
use crate::tls::{server_config, TlsIdentity, TrustStore};

const CLIENT_CLOSE_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerState {
    Stopped,
    Startup,
    Started,
    Shutdown,
}

pub trait ServerStateListener: Send + Sync {
    fn on_start(&self, _server: &Server) {}
    fn on_stop(&self, _server: &Server) {}
    fn on_fail(&self, _server: &Server, _error: &str) {}
}

pub trait ServerClientsListener: Send + Sync {
    fn on_client_connect(&self, _server: &Server, _client: &Peer) {}
    fn on_client_disconnect(&self, _server: &Server, _client: &Peer) {}
    fn on_client_fail(&self, _server: &Server, _client: &Peer, _error: &str) {}
}

pub trait ServerDataListener: Send + Sync {
    fn on_data_rx(&self, _server: &Server, _client: &Peer, _data: &[u8]) {}
    fn on_data_tx(&self, _server: &Server, _client: &Peer, _data: &[u8]) {}
}

#[derive(Debug, Clone)]
pub struct ServerTls {
    pub identity: TlsIdentity,
    pub trust: TrustStore,
    pub require_client_auth: bool,
    /// Run the cert sharing side channel on `port + 1`.
    pub cert_sharing: bool,
    pub cert_sharing_timeout: Duration,
}

impl ServerTls {
    pub fn new(identity: TlsIdentity, trust: TrustStore) -> Self {
        Self {
            identity,
            trust,
            require_client_auth: false,
            cert_sharing: false,
            cert_sharing_timeout: DEFAULT_CERT_SHARING_TIMEOUT,
        }
    }

    pub fn require_client_auth(mut self, required: bool) -> Self {
        self.require_client_auth = required;
        self
    }

    pub fn cert_sharing(mut self, enabled: bool) -> Self {
        self.cert_sharing = enabled;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub id: String,
    pub bind: SocketAddr,
    pub protocol: String,
    pub config: PeerConfig,
    pub tls: Option<ServerTls>,
}

impl ServerOptions {
    pub fn new(id: impl Into<String>, bind: SocketAddr) -> Self {
        Self {
            id: id.into(),
            bind,
            protocol: "tcp".to_string(),
            config: PeerConfig::default(),
            tls: None,
        }
    }

    pub fn config(mut self, config: PeerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn tls(mut self, tls: ServerTls) -> Self {
        self.tls = Some(tls);
        self
    }
}

#[derive(Debug, Clone)]
enum DefaultsChange {
    HeartBeat {
        prev: HeartBeatConfig,
        new: HeartBeatConfig,
    },
    Bye {
        prev: ByeMsgConfig,
        new: ByeMsgConfig,
    },
}

struct Defaults {
    encoding: DataEncoding,
    heartbeat: HeartBeatConfig,
    bye: ByeMsgConfig,
}

struct AcceptTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct ServerInner {
    id: String,
    bind: SocketAddr,
    protocol: String,
    tls: Option<ServerTls>,
    processor: Arc<dyn DataProcessor>,
    state: Mutex<ServerState>,
    local_addr: Mutex<Option<SocketAddr>>,
    defaults: Mutex<Defaults>,
    changes: broadcast::Sender<DefaultsChange>,
    clients: Mutex<Vec<Peer>>,
    accept: Mutex<Option<AcceptTask>>,
    cert_sharing: tokio::sync::Mutex<Option<CertSharingServer>>,
    state_listeners: Listeners<dyn ServerStateListener>,
    clients_listeners: Listeners<dyn ServerClientsListener>,
    data_listeners: Listeners<dyn ServerDataListener>,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl Server {
    pub fn new(options: ServerOptions, processor: Arc<dyn DataProcessor>) -> Self {
        let (changes, _) = broadcast::channel(16);
        let PeerConfig {
            encoding,
            heartbeat,
            bye,
        } = options.config;
        Self {
            inner: Arc::new(ServerInner {
                id: options.id,
                bind: options.bind,
                protocol: options.protocol,
                tls: options.tls,
                processor,
                state: Mutex::new(ServerState::Stopped),
                local_addr: Mutex::new(None),
                defaults: Mutex::new(Defaults {
                    encoding,
                    heartbeat: heartbeat.normalized(),
                    bye,
                }),
                changes,
                clients: Mutex::new(Vec::new()),
                accept: Mutex::new(None),
                cert_sharing: tokio::sync::Mutex::new(None),
                state_listeners: Listeners::default(),
                clients_listeners: Listeners::default(),
                data_listeners: Listeners::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn protocol(&self) -> &str {
        &self.inner.protocol
    }

    pub fn state(&self) -> ServerState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Started
    }

    /// Bound address, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn clients(&self) -> Vec<Peer> {
        self.inner.clients.lock().clone()
    }

    pub fn client(&self, remote_id: &str) -> Option<Peer> {
        self.inner
            .clients
            .lock()
            .iter()
            .find(|c| c.remote_id() == remote_id)
            .cloned()
    }

    // Defaults

    pub fn encoding(&self) -> DataEncoding {
        self.inner.defaults.lock().encoding.clone()
    }

    /// Applies to clients accepted from now on.
    pub fn set_encoding(&self, encoding: DataEncoding) {
        self.inner.defaults.lock().encoding = encoding;
    }

    pub fn heartbeat_defaults(&self) -> HeartBeatConfig {
        self.inner.defaults.lock().heartbeat
    }

    /// Pushed to live clients that did not override the previous default.
    pub fn set_heartbeat_defaults(&self, config: HeartBeatConfig) {
        let new = config.normalized();
        let mut defaults = self.inner.defaults.lock();
        let prev = std::mem::replace(&mut defaults.heartbeat, new);
        let _ = self.inner.changes.send(DefaultsChange::HeartBeat { prev, new });
    }

    pub fn bye_defaults(&self) -> ByeMsgConfig {
        self.inner.defaults.lock().bye.clone()
    }

    /// Pushed to live clients that did not override the previous default.
    pub fn set_bye_defaults(&self, config: ByeMsgConfig) {
        let mut defaults = self.inner.defaults.lock();
        let prev = std::mem::replace(&mut defaults.bye, config.clone());
        let _ = self.inner.changes.send(DefaultsChange::Bye { prev, new: config });
    }

    // Listeners

    pub fn add_state_listener(&self, listener: Arc<dyn ServerStateListener>) -> ListenerId {
        self.inner.state_listeners.add(listener)
    }

    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.inner.state_listeners.remove(id)
    }

    pub fn add_clients_listener(&self, listener: Arc<dyn ServerClientsListener>) -> ListenerId {
        self.inner.clients_listeners.add(listener)
    }

    pub fn remove_clients_listener(&self, id: ListenerId) -> bool {
        self.inner.clients_listeners.remove(id)
    }

    pub fn add_data_listener(&self, listener: Arc<dyn ServerDataListener>) -> ListenerId {
        self.inner.data_listeners.add(listener)
    }

    pub fn remove_data_listener(&self, id: ListenerId) -> bool {
        self.inner.data_listeners.remove(id)
    }

    fn emit_fail(&self, error: &str) {
        warn!("Server '{}' fail: {}", self.inner.id, error);
        self.inner.state_listeners.emit(|l| l.on_fail(self, error));
    }

    // Lifecycle

    /// Bind and start accepting. With TLS and cert sharing enabled also
    /// starts the side channel on the bound port + 1.
    pub async fn startup(&self) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                ServerState::Stopped => *state = ServerState::Startup,
                current => {
                    debug!("Server '{}' already {:?}", self.inner.id, current);
                    return Ok(());
                }
            }
        }

        match self.do_startup().await {
            Ok(local_addr) => {
                *self.inner.state.lock() = ServerState::Started;
                info!("Server '{}' listening on {}", self.inner.id, local_addr);
                self.inner.state_listeners.emit(|l| l.on_start(self));
                Ok(())
            }
            Err(e) => {
                *self.inner.state.lock() = ServerState::Stopped;
                self.emit_fail(&e.to_string());
                Err(e)
            }
        }
    }

    async fn do_startup(&self) -> Result<SocketAddr, ServerError> {
        let id = self.inner.id.clone();
        let listener = TcpListener::bind(self.inner.bind)
            .await
            .map_err(|source| ServerError::Startup {
                server: id.clone(),
                addr: self.inner.bind,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| ServerError::Startup {
            server: id.clone(),
            addr: self.inner.bind,
            source,
        })?;

        let acceptor = match &self.inner.tls {
            None => None,
            Some(tls) => {
                let config = server_config(&tls.identity, &tls.trust, tls.require_client_auth)
                    .map_err(|source| ServerError::Tls {
                        server: id.clone(),
                        source,
                    })?;
                if tls.cert_sharing {
                    let port = sharing_port(local_addr.port()).ok_or_else(|| ServerError::Startup {
                        server: id.clone(),
                        addr: local_addr,
                        source: io::Error::new(io::ErrorKind::InvalidInput, "no port left for certificate sharing"),
                    })?;
                    let sharing_addr = SocketAddr::new(local_addr.ip(), port);
                    let sharing = CertSharingServer::start(
                        &id,
                        sharing_addr,
                        Some(tls.identity.clone()),
                        tls.trust.clone(),
                        tls.cert_sharing_timeout,
                    )
                    .await
                    .map_err(|source| ServerError::Startup {
                        server: id.clone(),
                        addr: sharing_addr,
                        source,
                    })?;
                    *self.inner.cert_sharing.lock().await = Some(sharing);
                }
                Some(TlsAcceptor::from(config))
            }
        };

        *self.inner.local_addr.lock() = Some(local_addr);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(accept_loop(self.clone(), listener, acceptor, cancel.clone()));
        *self.inner.accept.lock() = Some(AcceptTask { cancel, handle });
        Ok(local_addr)
    }

    /// Stop accepting and disconnect every client. Errors from single
    /// clients are logged and ignored.
    pub async fn shutdown(&self) -> Result<(), ServerError> {
        {
            let mut state = self.inner.state.lock();
            if *state != ServerState::Started {
                debug!("Server '{}' not running ({:?})", self.inner.id, *state);
                return Ok(());
            }
            *state = ServerState::Shutdown;
        }

        let accept = self.inner.accept.lock().take();
        let mut result = Ok(());
        if let Some(accept) = accept {
            accept.cancel.cancel();
            if let Err(e) = accept.handle.await {
                result = Err(ServerError::Shutdown {
                    server: self.inner.id.clone(),
                    reason: e.to_string(),
                });
            }
        }

        for client in self.clients() {
            if let Err(e) = client.disconnect().await {
                warn!("Server '{}' error disconnecting client '{}': {}", self.inner.id, client, e);
            }
            if tokio::time::timeout(CLIENT_CLOSE_WAIT, client.closed()).await.is_err() {
                warn!("Server '{}' client '{}' did not close in time", self.inner.id, client);
            }
        }

        if let Some(sharing) = self.inner.cert_sharing.lock().await.take() {
            sharing.stop().await;
        }

        *self.inner.local_addr.lock() = None;
        *self.inner.state.lock() = ServerState::Stopped;
        info!("Server '{}' stopped", self.inner.id);
        self.inner.state_listeners.emit(|l| l.on_stop(self));
        result
    }

    async fn register_client<S>(&self, stream: S, remote: SocketAddr, local: Option<SocketAddr>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if !matches!(self.state(), ServerState::Startup | ServerState::Started) {
            debug!("Server '{}' not running, dropping client {}", self.inner.id, remote);
            return;
        }
        let remote_id = format!("{}://{}", self.inner.protocol, remote);
        let local_id = format!("{}@{}", remote, self.inner.id);

        // Snapshot and subscribe together so no change is missed or applied twice.
        let (config, changes) = {
            let defaults = self.inner.defaults.lock();
            let config = PeerConfig {
                encoding: defaults.encoding.clone(),
                heartbeat: defaults.heartbeat,
                bye: defaults.bye.clone(),
            };
            (config, self.inner.changes.subscribe())
        };

        let peer = Peer::new(local_id, remote_id, self.inner.protocol.clone(), config, self.inner.processor.clone());
        let bridge = Arc::new(ClientBridge {
            server: Arc::downgrade(&self.inner),
        });
        peer.add_connection_listener(bridge.clone());
        peer.add_data_listener(bridge);

        self.inner.clients.lock().push(peer.clone());
        tokio::spawn(follow_defaults(peer.clone(), changes));

        if !peer.attach(stream, local, Some(remote)).await {
            self.inner.clients.lock().retain(|c| c != &peer);
        }
    }
}

async fn accept_loop(server: Server, listener: TcpListener, acceptor: Option<TlsAcceptor>, cancel: CancellationToken) {
    // TLS handshakes in flight; aborted with the loop so none lands after shutdown.
    let mut handshakes = JoinSet::new();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => continue,
            accepted = listener.accept() => accepted,
        };
        let (tcp, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                server.emit_fail(&format!("Error accepting client: {}", e));
                continue;
            }
        };
        trace!("Server '{}' accepted {}", server.inner.id, remote);
        let _ = tcp.set_nodelay(true);
        let local = tcp.local_addr().ok();

        match &acceptor {
            None => server.register_client(tcp, remote, local).await,
            Some(acceptor) => {
                let acceptor = acceptor.clone();
                let server = server.clone();
                let timeout = server.heartbeat_defaults().timeout;
                handshakes.spawn(async move {
                    match tokio::time::timeout(timeout, acceptor.accept(tcp)).await {
                        Ok(Ok(stream)) => server.register_client(stream, remote, local).await,
                        Ok(Err(e)) => debug!("Server '{}' TLS handshake with {} failed: {}", server.inner.id, remote, e),
                        Err(_) => debug!("Server '{}' TLS handshake with {} timed out", server.inner.id, remote),
                    }
                });
            }
        }
    }
    handshakes.shutdown().await;
    trace!("Server '{}' accept loop terminated", server.inner.id);
}

async fn follow_defaults(peer: Peer, mut changes: broadcast::Receiver<DefaultsChange>) {
    let closed = peer.closed();
    tokio::pin!(closed);
    loop {
        let change = tokio::select! {
            _ = &mut closed => return,
            change = changes.recv() => change,
        };
        match change {
            Ok(DefaultsChange::HeartBeat { prev, new }) => peer.adopt_heartbeat(&prev, &new),
            Ok(DefaultsChange::Bye { prev, new }) => peer.adopt_bye(&prev, &new),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!("Client '{}' missed {} server default changes", peer, missed);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Forwards one client's events to the server's listeners.
struct ClientBridge {
    server: Weak<ServerInner>,
}

impl ClientBridge {
    fn server(&self) -> Option<Server> {
        self.server.upgrade().map(|inner| Server { inner })
    }
}

impl PeerConnectionListener for ClientBridge {
    fn on_connect(&self, peer: &Peer) {
        if let Some(server) = self.server() {
            server
                .inner
                .clients_listeners
                .emit(|l| l.on_client_connect(&server, peer));
        }
    }

    fn on_disconnect(&self, peer: &Peer) {
        if let Some(server) = self.server() {
            server.inner.clients.lock().retain(|c| c != peer);
            server
                .inner
                .clients_listeners
                .emit(|l| l.on_client_disconnect(&server, peer));
        }
    }

    fn on_fail(&self, peer: &Peer, error: &str) {
        if let Some(server) = self.server() {
            server
                .inner
                .clients_listeners
                .emit(|l| l.on_client_fail(&server, peer, error));
        }
    }
}

impl PeerDataListener for ClientBridge {
    fn on_data_rx(&self, peer: &Peer, data: &[u8]) {
        if let Some(server) = self.server() {
            server
                .inner
                .data_listeners
                .emit(|l| l.on_data_rx(&server, peer, data));
        }
    }

    fn on_data_tx(&self, peer: &Peer, data: &[u8]) {
        if let Some(server) = self.server() {
            server
                .inner
                .data_listeners
                .emit(|l| l.on_data_tx(&server, peer, data));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::DisconnectionReason;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn echo() -> Arc<dyn DataProcessor> {
        Arc::new(|_: &Peer, _: &str| true)
    }

    async fn started(config: PeerConfig) -> Server {
        let options = ServerOptions::new("srv", "127.0.0.1:0".parse().unwrap()).config(config);
        let server = Server::new(options, echo());
        server.startup().await.unwrap();
        server
    }

    async fn wait_clients(server: &Server, count: usize) {
        for _ in 0..100 {
            if server.clients().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients, got {}", count, server.clients().len());
    }

    #[tokio::test]
    async fn startup_and_shutdown_states() {
        let server = started(PeerConfig::default()).await;
        assert_eq!(server.state(), ServerState::Started);
        assert!(server.local_addr().is_some());

        // Second startup is a no-op.
        server.startup().await.unwrap();
        server.shutdown().await.unwrap();
        assert_eq!(server.state(), ServerState::Stopped);
        assert!(server.local_addr().is_none());
    }

    #[tokio::test]
    async fn bind_conflict_is_startup_error() {
        let server = started(PeerConfig::default()).await;
        let addr = server.local_addr().unwrap();
        let other = Server::new(ServerOptions::new("other", addr), echo());
        assert!(matches!(other.startup().await, Err(ServerError::Startup { .. })));
        assert_eq!(other.state(), ServerState::Stopped);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn client_ids_and_removal_on_disconnect() {
        let server = started(PeerConfig::default()).await;
        let socket = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        let local = socket.local_addr().unwrap();
        wait_clients(&server, 1).await;

        let client = server.clients().remove(0);
        assert_eq!(client.remote_id(), format!("tcp://{}", local));
        assert_eq!(client.local_id(), format!("{}@srv", local));
        assert!(server.client(&format!("tcp://{}", local)).is_some());

        drop(socket);
        client.closed().await;
        assert_eq!(client.disconnection_reason(), DisconnectionReason::ConnectionLost);
        wait_clients(&server, 0).await;
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn defaults_propagate_unless_overridden() {
        let server = started(PeerConfig::default()).await;
        let addr = server.local_addr().unwrap();
        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        wait_clients(&server, 2).await;

        let clients = server.clients();
        clients[1].set_bye_config(ByeMsgConfig::new(true, "ciao"));

        server.set_bye_defaults(ByeMsgConfig::new(true, "farewell"));
        let hb = HeartBeatConfig::new(Duration::from_secs(10), Duration::from_secs(2), true);
        server.set_heartbeat_defaults(hb);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(clients[0].bye_config(), ByeMsgConfig::new(true, "farewell"));
        assert_eq!(clients[1].bye_config(), ByeMsgConfig::new(true, "ciao"));
        assert_eq!(clients[0].heartbeat_config(), hb);
        assert_eq!(clients[1].heartbeat_config(), hb);
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn cert_sharing_on_last_port_fails_startup() {
        let identity = TlsIdentity::generate(vec!["srv".into()]).unwrap();
        let tls = ServerTls::new(identity, TrustStore::new()).cert_sharing(true);
        let options = ServerOptions::new("srv", "127.0.0.1:65535".parse().unwrap()).tls(tls);
        let server = Server::new(options, echo());
        assert!(matches!(server.startup().await, Err(ServerError::Startup { .. })));
        assert_eq!(server.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn stopped_server_drops_late_clients() {
        let server = Server::new(ServerOptions::new("srv", "127.0.0.1:0".parse().unwrap()), echo());
        let (ours, mut theirs) = tokio::io::duplex(64);
        server
            .register_client(ours, "127.0.0.1:4000".parse().unwrap(), None)
            .await;
        assert!(server.clients().is_empty());

        let mut received = Vec::new();
        theirs.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn shutdown_aborts_pending_handshakes() {
        let identity = TlsIdentity::generate(vec!["srv".into()]).unwrap();
        let options = ServerOptions::new("srv", "127.0.0.1:0".parse().unwrap())
            .tls(ServerTls::new(identity, TrustStore::new()));
        let server = Server::new(options, echo());
        server.startup().await.unwrap();

        // Connected but never sends a ClientHello.
        let mut socket = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown().await.unwrap();
        assert!(server.clients().is_empty());

        let mut buf = [0u8; 16];
        let released = tokio::time::timeout(Duration::from_secs(1), socket.read(&mut buf)).await;
        assert!(matches!(released, Ok(Ok(0)) | Ok(Err(_))));
    }

    #[tokio::test]
    async fn shutdown_disconnects_clients_with_bye() {
        let server = started(PeerConfig::default()).await;
        let mut socket = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        wait_clients(&server, 1).await;
        let client = server.clients().remove(0);

        server.shutdown().await.unwrap();
        assert_eq!(client.disconnection_reason(), DisconnectionReason::LocalRequest);

        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"bye\n");
    }
}
