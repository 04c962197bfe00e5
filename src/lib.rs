//! Framed peer-to-peer connections for the local network.
//!
//! A [`Server`] accepts connections and a [`Client`] opens one; both sides
//! are a [`Peer`] exchanging delimiter framed messages, probing liveness
//! with heartbeats and closing with a bye token. Connections can run over
//! TLS with a trust store bootstrapped by certificate sharing, and peers
//! find each other with [`discovery`].

pub mod bye;
pub mod certsharing;
pub mod client;
pub mod config;
pub mod discovery;
pub mod encoding;
pub mod error;
pub mod heartbeat;
pub mod listeners;
pub mod local;
pub mod peer;
pub mod server;
pub mod tls;

pub use bye::{ByeMsgConfig, ByeMsgListener};
pub use client::{Client, ClientOptions, ClientTls};
pub use config::{AutoReconnect, NodeConfig, PeerConfig};
pub use discovery::{Discover, DiscoveryService, DiscoveryState, Publisher};
pub use encoding::{Charset, DataEncoding, Token};
pub use error::{ConfigError, DiscoveryError, PeerError, ServerError, TlsError};
pub use heartbeat::{HeartBeatConfig, HeartBeatListener};
pub use listeners::ListenerId;
pub use local::{LocalConnector, LocalConnectorOptions};
pub use peer::{
    ConnectionInfo, ConnectionState, ConnectionStats, DataProcessor, DisconnectionReason, Peer,
    PeerConnectionListener, PeerDataListener,
};
pub use server::{Server, ServerOptions, ServerState, ServerTls};
pub use tls::{TlsIdentity, TrustStore};
