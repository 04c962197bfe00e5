//! Automatic connection to discovered services.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::client::{Client, ClientOptions, ClientTls};
use crate::config::PeerConfig;
use crate::discovery::{Discover, DiscoveryService, DiscoveryServicesListener};
use crate::error::DiscoveryError;
use crate::listeners::ListenerId;
use crate::peer::{DataProcessor, Peer, PeerConnectionListener};

#[derive(Debug, Clone)]
pub struct LocalConnectorOptions {
    /// Local id of every created client.
    pub local_id: String,
    /// Ignore services not announced on a loopback address.
    pub local_only: bool,
    pub protocol: String,
    pub config: PeerConfig,
    pub tls: Option<ClientTls>,
}

impl LocalConnectorOptions {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            local_only: false,
            protocol: "tcp".to_string(),
            config: PeerConfig::default(),
            tls: None,
        }
    }
}

struct ConnectorInner {
    options: LocalConnectorOptions,
    discover: Discover,
    processor: Arc<dyn DataProcessor>,
    runtime: Mutex<Option<Handle>>,
    listener: Mutex<Option<ListenerId>>,
    discovered: Mutex<Vec<DiscoveryService>>,
    clients: Mutex<Vec<(DiscoveryService, Client)>>,
    connected: AtomicUsize,
    errors: AtomicUsize,
    disconnected: AtomicUsize,
}

/// Connects a client to every service a [`Discover`] finds and drops it
/// when the service is lost.
#[derive(Clone)]
pub struct LocalConnector {
    inner: Arc<ConnectorInner>,
}

impl LocalConnector {
    pub fn new(discover: Discover, options: LocalConnectorOptions, processor: Arc<dyn DataProcessor>) -> Self {
        Self {
            inner: Arc::new(ConnectorInner {
                options,
                discover,
                processor,
                runtime: Mutex::default(),
                listener: Mutex::default(),
                discovered: Mutex::default(),
                clients: Mutex::default(),
                connected: AtomicUsize::new(0),
                errors: AtomicUsize::new(0),
                disconnected: AtomicUsize::new(0),
            }),
        }
    }

    pub fn discover(&self) -> &Discover {
        &self.inner.discover
    }

    pub fn is_running(&self) -> bool {
        self.inner.listener.lock().is_some()
    }

    /// Services currently discovered, including the ones filtered out.
    pub fn discovered(&self) -> Vec<DiscoveryService> {
        self.inner.discovered.lock().clone()
    }

    pub fn clients(&self) -> Vec<Client> {
        self.inner.clients.lock().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn client_for(&self, service: &DiscoveryService) -> Option<Client> {
        let clients = self.inner.clients.lock();
        clients
            .iter()
            .find(|(known, _)| service.matches(known))
            .map(|(_, client)| client.clone())
    }

    pub fn connected_count(&self) -> usize {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn connection_errors(&self) -> usize {
        self.inner.errors.load(Ordering::SeqCst)
    }

    pub fn disconnected_count(&self) -> usize {
        self.inner.disconnected.load(Ordering::SeqCst)
    }

    pub async fn start(&self) -> Result<(), DiscoveryError> {
        if self.is_running() {
            return Ok(());
        }
        *self.inner.runtime.lock() = Some(Handle::current());
        let id = self.inner.discover.add_services_listener(Arc::new(DiscoveryBridge {
            connector: Arc::downgrade(&self.inner),
        }));
        *self.inner.listener.lock() = Some(id);
        if let Err(e) = self.inner.discover.start().await {
            self.inner.listener.lock().take();
            self.inner.discover.remove_services_listener(id);
            return Err(e);
        }
        info!("Local connector '{}' started", self.inner.options.local_id);
        Ok(())
    }

    /// Stop discovery and disconnect every client.
    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        let Some(id) = self.inner.listener.lock().take() else {
            return Ok(());
        };
        self.inner.discover.remove_services_listener(id);
        let result = self.inner.discover.stop().await;

        self.inner.discovered.lock().clear();
        let clients = std::mem::take(&mut *self.inner.clients.lock());
        for (service, client) in clients {
            if client.state().is_disconnected() {
                continue;
            }
            if let Err(e) = client.disconnect().await {
                warn!("Local connector error disconnecting '{}': {}", service.name, e);
            }
        }
        info!("Local connector '{}' stopped", self.inner.options.local_id);
        result
    }
}

impl ConnectorInner {
    fn spawn<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match self.runtime.lock().as_ref() {
            Some(handle) => {
                handle.spawn(task);
            }
            None => warn!("Local connector '{}' has no runtime", self.options.local_id),
        }
    }
}

struct DiscoveryBridge {
    connector: Weak<ConnectorInner>,
}

impl DiscoveryServicesListener for DiscoveryBridge {
    fn on_service_discovered(&self, service: &DiscoveryService) {
        let Some(inner) = self.connector.upgrade() else { return };
        {
            let mut discovered = inner.discovered.lock();
            if service.already_in(&discovered) {
                return;
            }
            discovered.push(service.clone());
        }
        info!("Discovered service '{}' by '{}'", service, inner.options.local_id);

        if inner.options.local_only && !service.is_loopback() {
            warn!("Service '{}' does not use a loopback address, discarded", service);
            return;
        }
        let Some(addr) = service.socket_addr() else {
            warn!("Service '{}' has no address, discarded", service);
            return;
        };

        let mut options = ClientOptions::new(inner.options.local_id.clone(), service.name.clone(), addr)
            .protocol(inner.options.protocol.clone())
            .config(inner.options.config.clone());
        if let Some(tls) = &inner.options.tls {
            options = options.tls(tls.clone());
        }
        let client = Client::new(options, inner.processor.clone());
        client.add_connection_listener(Arc::new(ClientCounter {
            connector: Arc::downgrade(&inner),
        }));
        inner.clients.lock().push((service.clone(), client.clone()));

        let connector = Arc::downgrade(&inner);
        let service = service.clone();
        inner.spawn(async move {
            debug!("Connecting to '{}'", service);
            if let Err(e) = client.connect().await {
                warn!("Error connecting to discovered service '{}': {}", service, e);
                if let Some(inner) = connector.upgrade() {
                    inner.errors.fetch_add(1, Ordering::SeqCst);
                    inner.clients.lock().retain(|(_, known)| known.peer() != client.peer());
                }
            }
        });
    }

    fn on_service_lost(&self, service: &DiscoveryService) {
        let Some(inner) = self.connector.upgrade() else { return };
        {
            let mut discovered = inner.discovered.lock();
            match service.position_in(&discovered) {
                Some(index) => discovered.remove(index),
                None => return,
            };
        }
        let client = {
            let mut clients = inner.clients.lock();
            clients
                .iter()
                .position(|(known, _)| service.matches(known))
                .map(|index| clients.remove(index).1)
        };
        info!("Lost service '{}'", service);
        if let Some(client) = client {
            if !client.state().is_disconnected() {
                inner.spawn(async move {
                    if let Err(e) = client.disconnect().await {
                        debug!("Disconnecting lost service client '{}': {}", client.peer(), e);
                    }
                });
            }
        }
    }
}

struct ClientCounter {
    connector: Weak<ConnectorInner>,
}

impl PeerConnectionListener for ClientCounter {
    fn on_connect(&self, _peer: &Peer) {
        if let Some(inner) = self.connector.upgrade() {
            inner.connected.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_disconnect(&self, _peer: &Peer) {
        if let Some(inner) = self.connector.upgrade() {
            inner.disconnected.fetch_add(1, Ordering::SeqCst);
        }
    }
}
