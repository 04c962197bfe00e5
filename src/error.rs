//! Error types.
//!
//! Setup failures (bind, connect, handshake) and disconnection failures are
//! returned to the caller. Anything that happens while a connection is up is
//! reported through listeners instead, see [`crate::peer::DisconnectionReason`].

use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors returned by [`crate::peer::Peer`] and [`crate::client::Client`].
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// `send_data` called on a peer that is not connected.
    #[error("Peer '{0}' is not connected")]
    NotConnected(String),

    /// Writing to the connection stream failed.
    #[error("Peer '{peer}' stream error: {source}")]
    Stream {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    /// The connection could not be established.
    #[error("Peer '{peer}' can't connect to {addr}: {reason}")]
    Connection {
        peer: String,
        addr: SocketAddr,
        reason: String,
        /// True when the remote endpoint was simply not there (refused,
        /// unreachable, timed out). Only these failures trigger reconnection.
        remote_unavailable: bool,
    },

    /// Closing the connection failed.
    #[error("Peer '{peer}' disconnection error: {source}")]
    Disconnection {
        peer: String,
        #[source]
        source: std::io::Error,
    },

    /// The remote host name could not be resolved.
    #[error("Peer '{peer}' can't resolve host '{host}'")]
    UnknownHost { peer: String, host: String },
}

impl PeerError {
    pub(crate) fn connection(
        peer: impl Into<String>,
        addr: SocketAddr,
        reason: impl Into<String>,
    ) -> Self {
        PeerError::Connection {
            peer: peer.into(),
            addr,
            reason: reason.into(),
            remote_unavailable: false,
        }
    }

    pub(crate) fn connection_io(peer: impl Into<String>, addr: SocketAddr, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let remote_unavailable = matches!(
            err.kind(),
            ErrorKind::ConnectionRefused
                | ErrorKind::ConnectionReset
                | ErrorKind::TimedOut
                | ErrorKind::HostUnreachable
                | ErrorKind::NetworkUnreachable
                | ErrorKind::AddrNotAvailable
        );
        PeerError::Connection {
            peer: peer.into(),
            addr,
            reason: err.to_string(),
            remote_unavailable,
        }
    }

    /// Whether this is a connection failure caused by a missing remote endpoint.
    pub fn is_remote_unavailable(&self) -> bool {
        matches!(
            self,
            PeerError::Connection {
                remote_unavailable: true,
                ..
            }
        )
    }
}

/// Errors returned by [`crate::server::Server`].
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Server '{server}' can't bind {addr}: {source}")]
    Startup {
        server: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server '{server}' shutdown error: {reason}")]
    Shutdown { server: String, reason: String },

    #[error("Server '{server}' TLS error: {source}")]
    Tls {
        server: String,
        #[source]
        source: TlsError,
    },
}

/// Certificate, trust store and rustls configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("Certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Invalid private key: {0}")]
    InvalidKey(String),

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("Trust store file {path}: {reason}")]
    Store { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from discovery backends, [`crate::discovery::Discover`] and
/// [`crate::discovery::Publisher`].
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Discovery backend error: {0}")]
    Backend(String),

    #[error("Can't find '{0}' discovery implementation")]
    UnknownImplementation(String),

    #[error("Can't publish service '{name}': {reason}")]
    Publish { name: String, reason: String },
}

impl From<mdns_sd::Error> for DiscoveryError {
    fn from(err: mdns_sd::Error) -> Self {
        DiscoveryError::Backend(err.to_string())
    }
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn refused_connection_is_remote_unavailable() {
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let err = PeerError::connection_io("cl", addr, &Error::from(ErrorKind::ConnectionRefused));
        assert!(err.is_remote_unavailable());

        let err = PeerError::connection_io("cl", addr, &Error::from(ErrorKind::InvalidData));
        assert!(!err.is_remote_unavailable());
        assert!(!PeerError::connection("cl", addr, "handshake").is_remote_unavailable());
    }

    #[test]
    fn error_messages_name_the_peer() {
        let err = PeerError::NotConnected("obj-1".into());
        assert_eq!(err.to_string(), "Peer 'obj-1' is not connected");

        let err = DiscoveryError::UnknownImplementation("bonjour".into());
        assert!(err.to_string().contains("bonjour"));
    }
}
