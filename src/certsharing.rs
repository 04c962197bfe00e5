//! Certificate exchange on `port + 1`.
//!
//! Plain TCP, no framing: each side writes its certificate DER once and
//! reads until the bytes received form one complete certificate. The
//! received certificate is trusted as is. This bootstraps mutual TLS on
//! first contact and is not authenticated.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::tls::{der_length, TlsIdentity, TrustStore};

pub const PROTO_NAME: &str = "CertSharing";

/// Port the cert sharing side channel uses for a server bound to `port`.
/// `None` when `port` is the last one.
pub fn sharing_port(port: u16) -> Option<u16> {
    port.checked_add(1)
}

/// Read until a complete certificate arrived. `None` if the stream ended first.
async fn read_certificate<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(len) = der_length(&buffer) {
            if buffer.len() >= len {
                buffer.truncate(len);
                return Ok(Some(buffer));
            }
        }
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(None);
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

fn store(trust: &TrustStore, alias: &str, cert: Vec<u8>) -> bool {
    match trust.add(alias, cert) {
        Ok(()) => true,
        Err(e) => {
            warn!("Can't store certificate for '{}': {}", alias, e);
            false
        }
    }
}

/// Side-channel listener started next to a TLS server.
pub struct CertSharingServer {
    id: String,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CertSharingServer {
    pub async fn start(
        server_id: &str,
        bind: SocketAddr,
        identity: Option<TlsIdentity>,
        trust: TrustStore,
        timeout: Duration,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        let id = format!("{}-{}", server_id, PROTO_NAME);
        let cancel = CancellationToken::new();

        info!("Cert sharing server '{}' listening on {}", id, local_addr);
        let task = tokio::spawn(accept_loop(
            id.clone(),
            listener,
            identity,
            trust,
            timeout,
            cancel.clone(),
        ));

        Ok(Self {
            id,
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            info!("Cert sharing server '{}' stopped", self.id);
        }
    }
}

impl Drop for CertSharingServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    id: String,
    listener: TcpListener,
    identity: Option<TlsIdentity>,
    trust: TrustStore,
    timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Cert sharing server '{}' accept error: {}", id, e);
                continue;
            }
        };
        let cert = identity.as_ref().map(|i| i.cert_der().to_vec());
        let trust = trust.clone();
        let id = id.clone();
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, share_with_client(stream, remote, cert, &trust)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Cert sharing server '{}' error with {}: {}", id, remote, e),
                Err(_) => debug!("Cert sharing server '{}' timed out with {}", id, remote),
            }
        });
    }
}

async fn share_with_client(
    mut stream: TcpStream,
    remote: SocketAddr,
    local_cert: Option<Vec<u8>>,
    trust: &TrustStore,
) -> io::Result<()> {
    if let Some(cert) = local_cert {
        trace!("Cert sharing server send certificate to {}", remote);
        stream.write_all(&cert).await?;
        stream.flush().await?;
    }
    if let Some(cert) = read_certificate(&mut stream).await? {
        let alias = format!("CL@{}", remote);
        if store(trust, &alias, cert) {
            info!("Stored client certificate '{}'", alias);
        }
    }
    stream.shutdown().await
}

/// Exchange certificates with the sharing server at `addr`.
///
/// The received certificate is stored under `remote_alias`. Returns true
/// when the exchange completed before `timeout`: the remote certificate was
/// stored and ours (if any) was sent.
pub async fn share_certificate(
    addr: SocketAddr,
    identity: Option<&TlsIdentity>,
    trust: &TrustStore,
    remote_alias: &str,
    timeout: Duration,
) -> io::Result<bool> {
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await?;
        if let Some(identity) = identity {
            trace!("Cert sharing client send certificate to {}", addr);
            stream.write_all(identity.cert_der()).await?;
            stream.flush().await?;
        }
        let received = match read_certificate(&mut stream).await? {
            Some(cert) => store(trust, remote_alias, cert),
            None => false,
        };
        let _ = stream.shutdown().await;
        Ok::<bool, io::Error>(received)
    };

    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Cert sharing with {} timed out after {:?}", addr, timeout);
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sharing_port_is_next_one() {
        assert_eq!(sharing_port(8000), Some(8001));
        assert_eq!(sharing_port(u16::MAX), None);
    }

    #[tokio::test]
    async fn certificate_read_across_chunks() {
        let identity = TlsIdentity::generate(vec!["x".into()]).unwrap();
        let der = identity.cert_der().to_vec();
        let (mut tx, mut rx) = tokio::io::duplex(16);

        let payload = der.clone();
        let writer = tokio::spawn(async move {
            for chunk in payload.chunks(7) {
                tx.write_all(chunk).await.unwrap();
            }
            tx
        });
        let cert = read_certificate(&mut rx).await.unwrap();
        assert_eq!(cert, Some(der));
        drop(writer.await.unwrap());
    }

    #[tokio::test]
    async fn truncated_certificate_yields_none() {
        let (mut tx, mut rx) = tokio::io::duplex(4096);
        tx.write_all(&[0x30, 0x82, 0x01, 0x00, 0x01, 0x02]).await.unwrap();
        drop(tx);
        assert_eq!(read_certificate(&mut rx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn both_sides_store_each_other() {
        let server_identity = TlsIdentity::generate(vec!["srv".into()]).unwrap();
        let client_identity = TlsIdentity::generate(vec!["cl".into()]).unwrap();
        let server_trust = TrustStore::new();
        let client_trust = TrustStore::new();

        let server = CertSharingServer::start(
            "srv",
            "127.0.0.1:0".parse().unwrap(),
            Some(server_identity.clone()),
            server_trust.clone(),
            Duration::from_secs(2),
        )
        .await
        .unwrap();

        let done = share_certificate(
            server.local_addr(),
            Some(&client_identity),
            &client_trust,
            "srv",
            Duration::from_secs(2),
        )
        .await
        .unwrap();
        assert!(done);
        assert_eq!(client_trust.get("srv").as_deref(), Some(server_identity.cert_der()));

        // The server stores after its read completes.
        for _ in 0..50 {
            if server_trust.contains_cert(client_identity.cert_der()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(server_trust.contains_cert(client_identity.cert_der()));
        assert!(server_trust.aliases()[0].starts_with("CL@127.0.0.1:"));
        server.stop().await;
    }
}
