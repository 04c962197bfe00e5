//! Client side connection setup.
//!
//! A [`Client`] wraps the [`Peer`] it connects. Register listeners on the
//! client before calling [`Client::connect`] to observe every event.

use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, trace};

use crate::certsharing::{share_certificate, sharing_port};
use crate::config::{AutoReconnect, PeerConfig, DEFAULT_CERT_SHARING_TIMEOUT};
use crate::error::PeerError;
use crate::peer::{ConnectionState, DataProcessor, Peer};
use crate::tls::{client_config, TlsIdentity, TrustStore};

/// TLS settings of a client connection.
#[derive(Debug, Clone)]
pub struct ClientTls {
    pub identity: Option<TlsIdentity>,
    pub trust: TrustStore,
    /// On handshake failure exchange certificates on `port + 1` and retry once.
    pub cert_sharing: bool,
    pub cert_sharing_timeout: Duration,
}

impl ClientTls {
    pub fn new(identity: Option<TlsIdentity>, trust: TrustStore) -> Self {
        Self {
            identity,
            trust,
            cert_sharing: false,
            cert_sharing_timeout: DEFAULT_CERT_SHARING_TIMEOUT,
        }
    }

    pub fn with_cert_sharing(mut self, enabled: bool) -> Self {
        self.cert_sharing = enabled;
        self
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub local_id: String,
    pub remote_id: String,
    /// IP literal or host name.
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub config: PeerConfig,
    pub reconnect: AutoReconnect,
    pub tls: Option<ClientTls>,
}

impl ClientOptions {
    pub fn new(local_id: impl Into<String>, remote_id: impl Into<String>, addr: SocketAddr) -> Self {
        Self::with_host(local_id, remote_id, addr.ip().to_string(), addr.port())
    }

    pub fn with_host(
        local_id: impl Into<String>,
        remote_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            remote_id: remote_id.into(),
            host: host.into(),
            port,
            protocol: "tcp".to_string(),
            config: PeerConfig::default(),
            reconnect: AutoReconnect::default(),
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

    pub fn reconnect(mut self, reconnect: AutoReconnect) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn tls(mut self, tls: ClientTls) -> Self {
        self.tls = Some(tls);
        self
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    peer: Peer,
    options: Arc<ClientOptions>,
}

impl Deref for Client {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Client {
    pub fn new(options: ClientOptions, processor: Arc<dyn DataProcessor>) -> Self {
        let peer = Peer::new(
            options.local_id.clone(),
            options.remote_id.clone(),
            options.protocol.clone(),
            options.config.clone(),
            processor,
        );
        Self {
            peer,
            options: Arc::new(options),
        }
    }

    /// Build a client and connect it.
    pub async fn connect_new(options: ClientOptions, processor: Arc<dyn DataProcessor>) -> Result<Self, PeerError> {
        let client = Self::new(options, processor);
        client.connect().await?;
        Ok(client)
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    /// Connect to the remote.
    ///
    /// If the remote is unavailable and auto-reconnect is enabled the peer
    /// goes `Waiting`, retries in the background and this returns `Ok`.
    pub async fn connect(&self) -> Result<(), PeerError> {
        match self.peer.state() {
            ConnectionState::Connected | ConnectionState::Waiting => return Ok(()),
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {
                return Err(PeerError::connection(
                    self.options.local_id.clone(),
                    self.fallback_addr(),
                    "peer already disconnected, create a new client to reconnect",
                ));
            }
            ConnectionState::Connecting => {}
        }

        self.peer.set_connecting();
        match self.attempt().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_remote_unavailable() && self.options.reconnect.enabled => {
                debug!("Client '{}' remote unavailable: {}", self.options.local_id, e);
                if self.peer.set_waiting() {
                    tokio::spawn(self.clone().reconnect_loop());
                }
                Ok(())
            }
            Err(e) => {
                self.peer.fail_setup(&e.to_string());
                Err(e)
            }
        }
    }

    async fn reconnect_loop(self) {
        let token = self.peer.cancellation();
        let delay = self.options.reconnect.delay;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            trace!("Client '{}' reconnecting to {}:{}", self.options.local_id, self.options.host, self.options.port);
            match self.attempt().await {
                Ok(()) => return,
                Err(e) if e.is_remote_unavailable() => {}
                Err(e) => self.peer.emit_fail(&e.to_string()),
            }
        }
    }

    fn fallback_addr(&self) -> SocketAddr {
        let ip = self
            .options
            .host
            .parse::<IpAddr>()
            .unwrap_or(IpAddr::from([0, 0, 0, 0]));
        SocketAddr::new(ip, self.options.port)
    }

    async fn resolve(&self) -> Result<SocketAddr, PeerError> {
        if let Ok(ip) = self.options.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.options.port));
        }
        let unknown = || PeerError::UnknownHost {
            peer: self.options.local_id.clone(),
            host: self.options.host.clone(),
        };
        tokio::net::lookup_host((self.options.host.as_str(), self.options.port))
            .await
            .map_err(|_| unknown())?
            .next()
            .ok_or_else(unknown)
    }

    async fn open_tcp(&self, addr: SocketAddr) -> Result<TcpStream, PeerError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| PeerError::connection_io(self.options.local_id.clone(), addr, &e))?;
        let _ = stream.set_nodelay(true);
        Ok(stream)
    }

    async fn attempt(&self) -> Result<(), PeerError> {
        let addr = self.resolve().await?;
        let tcp = self.open_tcp(addr).await?;
        let local_addr = tcp.local_addr().ok();

        let attached = match &self.options.tls {
            None => self.peer.attach(tcp, local_addr, Some(addr)).await,
            Some(tls) => {
                let stream = match self.handshake(tls, tcp, addr).await {
                    Ok(stream) => stream,
                    Err(e) if tls.cert_sharing => {
                        debug!("Client '{}' handshake failed ({}), sharing certificates", self.options.local_id, e);
                        self.share(tls, addr).await?;
                        let tcp = self.open_tcp(addr).await?;
                        self.handshake(tls, tcp, addr).await?
                    }
                    Err(e) => return Err(e),
                };
                self.peer.attach(stream, local_addr, Some(addr)).await
            }
        };

        if !attached {
            return Err(PeerError::connection(
                self.options.local_id.clone(),
                addr,
                "peer disconnected while connecting",
            ));
        }
        info!("Client '{}' connected to {}", self.options.local_id, addr);
        Ok(())
    }

    async fn handshake(
        &self,
        tls: &ClientTls,
        tcp: TcpStream,
        addr: SocketAddr,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, PeerError> {
        let local_id = self.options.local_id.clone();
        let config = client_config(tls.identity.as_ref(), &tls.trust)
            .map_err(|e| PeerError::connection(local_id.clone(), addr, e.to_string()))?;
        let connector = TlsConnector::from(config);
        let timeout = self.options.config.heartbeat.timeout;
        match tokio::time::timeout(timeout, connector.connect(ServerName::from(addr.ip()), tcp)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(PeerError::connection(local_id, addr, format!("TLS handshake failed: {}", e))),
            Err(_) => Err(PeerError::connection(local_id, addr, "TLS handshake timed out")),
        }
    }

    async fn share(&self, tls: &ClientTls, addr: SocketAddr) -> Result<(), PeerError> {
        let port = sharing_port(addr.port()).ok_or_else(|| {
            PeerError::connection(self.options.local_id.clone(), addr, "no port left for certificate sharing")
        })?;
        let sharing = SocketAddr::new(addr.ip(), port);
        let done = share_certificate(
            sharing,
            tls.identity.as_ref(),
            &tls.trust,
            &self.options.remote_id,
            tls.cert_sharing_timeout,
        )
        .await
        .map_err(|e| PeerError::connection_io(self.options.local_id.clone(), sharing, &e))?;
        if !done {
            return Err(PeerError::connection(
                self.options.local_id.clone(),
                sharing,
                "certificate sharing did not complete",
            ));
        }
        Ok(())
    }
}
