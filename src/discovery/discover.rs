use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{
    backend, BackendEvent, BrowseId, DiscoveryBackend, DiscoveryService, DiscoveryServicesListener, DiscoveryState,
    DiscoveryStateListener,
};
use crate::error::DiscoveryError;
use crate::listeners::{ListenerId, Listeners};

struct Session {
    browse: BrowseId,
    cancel: CancellationToken,
}

struct DiscoverInner {
    service_type: String,
    backend: Arc<dyn DiscoveryBackend>,
    state: Mutex<DiscoveryState>,
    services: Mutex<Vec<DiscoveryService>>,
    interfaces: Mutex<Vec<String>>,
    session: Mutex<Option<Session>>,
    state_listeners: Listeners<dyn DiscoveryStateListener>,
    services_listeners: Listeners<dyn DiscoveryServicesListener>,
}

impl Drop for DiscoverInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
            let _ = self.backend.stop_browse(session.browse);
        }
    }
}

/// Tracks the services of one type.
///
/// Each service is kept once per interface; repeated resolutions are
/// ignored. Listeners are called from the discovery task.
#[derive(Clone)]
pub struct Discover {
    inner: Arc<DiscoverInner>,
}

impl Discover {
    pub fn new(implementation: &str, service_type: impl Into<String>) -> Result<Self, DiscoveryError> {
        Ok(Self::with_backend(backend(implementation)?, service_type))
    }

    pub fn with_backend(backend: Arc<dyn DiscoveryBackend>, service_type: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(DiscoverInner {
                service_type: service_type.into(),
                backend,
                state: Mutex::new(DiscoveryState::Stopped),
                services: Mutex::default(),
                interfaces: Mutex::default(),
                session: Mutex::default(),
                state_listeners: Listeners::default(),
                services_listeners: Listeners::default(),
            }),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.inner.service_type
    }

    pub fn implementation(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn state(&self) -> DiscoveryState {
        *self.inner.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn services(&self) -> Vec<DiscoveryService> {
        self.inner.services.lock().clone()
    }

    /// Interfaces on which at least one service of this type was seen.
    pub fn interfaces(&self) -> Vec<String> {
        self.inner.interfaces.lock().clone()
    }

    pub fn add_state_listener(&self, listener: Arc<dyn DiscoveryStateListener>) -> ListenerId {
        self.inner.state_listeners.add(listener)
    }

    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.inner.state_listeners.remove(id)
    }

    pub fn add_services_listener(&self, listener: Arc<dyn DiscoveryServicesListener>) -> ListenerId {
        self.inner.services_listeners.add(listener)
    }

    pub fn remove_services_listener(&self, id: ListenerId) -> bool {
        self.inner.services_listeners.remove(id)
    }

    fn set_state(&self, state: DiscoveryState) {
        *self.inner.state.lock() = state;
    }

    pub async fn start(&self) -> Result<(), DiscoveryError> {
        {
            let mut state = self.inner.state.lock();
            if state.is_running() {
                return Ok(());
            }
            *state = DiscoveryState::Startup;
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let browse = match self.inner.backend.browse(&self.inner.service_type, tx) {
            Ok(browse) => browse,
            Err(e) => {
                self.set_state(DiscoveryState::Stopped);
                warn!("Discover '{}' start failed: {}", self.inner.service_type, e);
                let error = e.to_string();
                self.inner
                    .state_listeners
                    .emit(|l| l.on_fail(&self.inner.service_type, &error));
                return Err(e);
            }
        };

        let cancel = CancellationToken::new();
        *self.inner.session.lock() = Some(Session {
            browse,
            cancel: cancel.clone(),
        });
        tokio::spawn(event_loop(Arc::downgrade(&self.inner), rx, cancel));

        self.set_state(DiscoveryState::Started);
        info!(
            "Discover '{}' started ({})",
            self.inner.service_type,
            self.inner.backend.name()
        );
        self.inner
            .state_listeners
            .emit(|l| l.on_start(&self.inner.service_type));
        Ok(())
    }

    /// Stop browsing. Every tracked service is reported lost.
    pub async fn stop(&self) -> Result<(), DiscoveryError> {
        {
            let mut state = self.inner.state.lock();
            if !state.is_running() {
                return Ok(());
            }
            *state = DiscoveryState::Shutdown;
        }

        let mut result = Ok(());
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.cancel.cancel();
            if let Err(e) = self.inner.backend.stop_browse(session.browse) {
                warn!("Discover '{}' stop failed: {}", self.inner.service_type, e);
                let error = e.to_string();
                self.inner
                    .state_listeners
                    .emit(|l| l.on_fail(&self.inner.service_type, &error));
                result = Err(e);
            }
        }

        self.deregister_all_services();
        self.inner.interfaces.lock().clear();
        self.set_state(DiscoveryState::Stopped);
        info!("Discover '{}' stopped", self.inner.service_type);
        self.inner
            .state_listeners
            .emit(|l| l.on_stop(&self.inner.service_type));
        result
    }

    fn register_interface(&self, intf: &str) {
        let mut interfaces = self.inner.interfaces.lock();
        if !interfaces.iter().any(|known| known.eq_ignore_ascii_case(intf)) {
            interfaces.push(intf.to_string());
        }
    }

    fn register_service(&self, service: DiscoveryService) {
        {
            let mut services = self.inner.services.lock();
            if service.already_in(&services) {
                trace!("Service '{}' already discovered", service);
                return;
            }
            services.push(service.clone());
        }
        debug!("Discovered service '{}'", service);
        self.inner
            .services_listeners
            .emit(|l| l.on_service_discovered(&service));
    }

    fn deregister_service(&self, service: &DiscoveryService) {
        let removed = {
            let mut services = self.inner.services.lock();
            match service.position_in(&services) {
                Some(index) => services.remove(index),
                None => return,
            }
        };
        debug!("Lost service '{}'", removed);
        self.inner
            .services_listeners
            .emit(|l| l.on_service_lost(&removed));
    }

    fn deregister_all_services(&self) {
        let services = std::mem::take(&mut *self.inner.services.lock());
        for service in services {
            debug!("Lost service '{}'", service);
            self.inner
                .services_listeners
                .emit(|l| l.on_service_lost(&service));
        }
    }
}

async fn event_loop(
    inner: Weak<DiscoverInner>,
    mut events: mpsc::UnboundedReceiver<BackendEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        let discover = Discover { inner };
        match event {
            BackendEvent::Resolved(service) => {
                discover.register_interface(&service.intf);
                discover.register_service(service);
            }
            BackendEvent::Removed(service) => discover.deregister_service(&service),
        }
    }
}
