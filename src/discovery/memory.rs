//! In-process discovery bus.
//!
//! Every registration shows up once per bus interface, on the loopback
//! address. Foreign services can be injected with [`MemoryBus::announce`]
//! to simulate other hosts.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::trace;

use super::mdns::service_type_domain;
use super::{BackendEvent, BrowseId, DiscoveryBackend, DiscoveryService, Registration};
use crate::error::DiscoveryError;

static DEFAULT_BUS: Lazy<Arc<MemoryBus>> = Lazy::new(MemoryBus::new);
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

struct Browser {
    type_domain: String,
    events: UnboundedSender<BackendEvent>,
}

#[derive(Default)]
struct BusState {
    interfaces: Vec<String>,
    registrations: HashMap<String, Registration>,
    announced: Vec<DiscoveryService>,
    browsers: HashMap<u64, Browser>,
}

impl BusState {
    fn expand(&self, registration: &Registration) -> Vec<DiscoveryService> {
        self.interfaces
            .iter()
            .map(|intf| {
                DiscoveryService::resolved(
                    registration.name.clone(),
                    service_type_domain(&registration.service_type),
                    intf.clone(),
                    IpAddr::V4(Ipv4Addr::LOCALHOST),
                    registration.port,
                    registration.extra.clone(),
                )
            })
            .collect()
    }

    fn visible(&self) -> Vec<DiscoveryService> {
        let mut services: Vec<DiscoveryService> = self
            .registrations
            .values()
            .flat_map(|registration| self.expand(registration))
            .collect();
        services.extend(self.announced.iter().cloned());
        services
    }

    fn notify(&self, event: BackendEvent) {
        let service = match &event {
            BackendEvent::Resolved(service) | BackendEvent::Removed(service) => service,
        };
        let type_domain = service_type_domain(&service.service_type);
        for browser in self.browsers.values() {
            if browser.type_domain == type_domain {
                let _ = browser.events.send(event.clone());
            }
        }
    }
}

pub struct MemoryBus {
    state: Mutex<BusState>,
}

impl MemoryBus {
    /// A bus with the single interface `lo`.
    pub fn new() -> Arc<Self> {
        Self::with_interfaces(&["lo"])
    }

    pub fn with_interfaces(interfaces: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BusState {
                interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
                ..Default::default()
            }),
        })
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.state.lock().interfaces.clone()
    }

    /// Inject a service as if another host advertised it.
    pub fn announce(&self, service: DiscoveryService) {
        let mut state = self.state.lock();
        if service.already_in(&state.announced) {
            return;
        }
        state.announced.push(service.clone());
        state.notify(BackendEvent::Resolved(service));
    }

    pub fn withdraw(&self, service: &DiscoveryService) {
        let mut state = self.state.lock();
        if let Some(index) = service.position_in(&state.announced) {
            let removed = state.announced.remove(index);
            state.notify(BackendEvent::Removed(removed));
        }
    }
}

/// Backend handle on a [`MemoryBus`].
#[derive(Clone)]
pub struct MemoryBackend {
    bus: Arc<MemoryBus>,
}

impl MemoryBackend {
    /// Backend on the process-wide bus.
    pub fn shared() -> Self {
        Self::on(DEFAULT_BUS.clone())
    }

    pub fn on(bus: Arc<MemoryBus>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }
}

impl DiscoveryBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn browse(&self, service_type: &str, events: UnboundedSender<BackendEvent>) -> Result<BrowseId, DiscoveryError> {
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let type_domain = service_type_domain(service_type);
        let mut state = self.bus.state.lock();
        for service in state.visible() {
            if service_type_domain(&service.service_type) == type_domain {
                let _ = events.send(BackendEvent::Resolved(service));
            }
        }
        trace!("Memory bus browse #{} for '{}'", id, type_domain);
        state.browsers.insert(id, Browser { type_domain, events });
        Ok(BrowseId(id))
    }

    fn stop_browse(&self, id: BrowseId) -> Result<(), DiscoveryError> {
        self.bus.state.lock().browsers.remove(&id.0);
        Ok(())
    }

    fn register(&self, registration: &Registration) -> Result<String, DiscoveryError> {
        let key = format!("{}#{}", registration.name, NEXT_ID.fetch_add(1, Ordering::Relaxed));
        let mut state = self.bus.state.lock();
        for service in state.expand(registration) {
            state.notify(BackendEvent::Resolved(service));
        }
        state.registrations.insert(key.clone(), registration.clone());
        Ok(key)
    }

    fn unregister(&self, key: &str) -> Result<(), DiscoveryError> {
        let mut state = self.bus.state.lock();
        let registration = state
            .registrations
            .remove(key)
            .ok_or_else(|| DiscoveryError::Backend(format!("no registration '{}'", key)))?;
        for service in state.expand(&registration) {
            state.notify(BackendEvent::Removed(service));
        }
        Ok(())
    }
}
