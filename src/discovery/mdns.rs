//! mDNS backend on `mdns-sd`.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mdns_sd::{Receiver, ServiceDaemon, ServiceEvent, ServiceInfo};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, trace, warn};

use super::names::decode_dnssd;
use super::{interface_for, BackendEvent, BrowseId, DiscoveryBackend, DiscoveryService, Registration};
use crate::error::DiscoveryError;

/// TXT property carrying the opaque extra text.
pub const EXTRA_PROPERTY: &str = "extra";

static SHARED: OnceCell<Arc<MdnsBackend>> = OnceCell::new();
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// `_svc._tcp` and `_svc._tcp.local` become `_svc._tcp.local.`.
pub fn service_type_domain(service_type: &str) -> String {
    let ty = service_type.trim_end_matches('.');
    if ty.ends_with(".local") {
        format!("{}.", ty)
    } else {
        format!("{}.local.", ty)
    }
}

fn instance_name(fullname: &str, type_domain: &str) -> String {
    let name = fullname
        .strip_suffix(type_domain)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname);
    decode_dnssd(name)
}

#[derive(Default)]
struct TypeBrowse {
    browsers: HashMap<u64, UnboundedSender<BackendEvent>>,
    resolved: HashMap<String, Vec<DiscoveryService>>,
}

type Browses = Arc<Mutex<HashMap<String, TypeBrowse>>>;

/// One `ServiceDaemon` shared by every browse and registration.
///
/// The daemon browses each type once; events fan out to all browsers of
/// that type.
pub struct MdnsBackend {
    daemon: ServiceDaemon,
    browses: Browses,
    browse_types: Mutex<HashMap<u64, String>>,
}

impl MdnsBackend {
    pub fn new() -> Result<Self, DiscoveryError> {
        Ok(Self {
            daemon: ServiceDaemon::new()?,
            browses: Arc::default(),
            browse_types: Mutex::default(),
        })
    }

    /// Process-wide backend, created on first use.
    pub fn shared() -> Result<Arc<Self>, DiscoveryError> {
        SHARED.get_or_try_init(|| Self::new().map(Arc::new)).cloned()
    }
}

impl Drop for MdnsBackend {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.shutdown() {
            debug!("mDNS daemon shutdown: {}", e);
        }
    }
}

impl DiscoveryBackend for MdnsBackend {
    fn name(&self) -> &'static str {
        "mdns"
    }

    fn browse(&self, service_type: &str, events: UnboundedSender<BackendEvent>) -> Result<BrowseId, DiscoveryError> {
        let type_domain = service_type_domain(service_type);
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        let mut browses = self.browses.lock();
        match browses.get_mut(&type_domain) {
            Some(browse) => {
                for service in browse.resolved.values().flatten() {
                    let _ = events.send(BackendEvent::Resolved(service.clone()));
                }
                browse.browsers.insert(id, events);
            }
            None => {
                let receiver = self.daemon.browse(&type_domain)?;
                let mut browse = TypeBrowse::default();
                browse.browsers.insert(id, events);
                browses.insert(type_domain.clone(), browse);
                tokio::spawn(forward(type_domain.clone(), receiver, self.browses.clone()));
                debug!("mDNS browsing '{}'", type_domain);
            }
        }
        self.browse_types.lock().insert(id, type_domain);
        Ok(BrowseId(id))
    }

    fn stop_browse(&self, id: BrowseId) -> Result<(), DiscoveryError> {
        let Some(type_domain) = self.browse_types.lock().remove(&id.0) else {
            return Ok(());
        };
        let mut browses = self.browses.lock();
        let last = match browses.get_mut(&type_domain) {
            Some(browse) => {
                browse.browsers.remove(&id.0);
                browse.browsers.is_empty()
            }
            None => false,
        };
        if last {
            browses.remove(&type_domain);
            self.daemon.stop_browse(&type_domain)?;
            debug!("mDNS stopped browsing '{}'", type_domain);
        }
        Ok(())
    }

    fn register(&self, registration: &Registration) -> Result<String, DiscoveryError> {
        let type_domain = service_type_domain(&registration.service_type);
        let host = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "lanlink".to_string());
        let host_domain = format!("{}.local.", host.trim_end_matches(".local"));

        let mut properties = HashMap::new();
        if let Some(extra) = &registration.extra {
            properties.insert(EXTRA_PROPERTY.to_string(), extra.clone());
        }

        let service_info = ServiceInfo::new(
            &type_domain,
            &registration.name,
            &host_domain,
            "",
            registration.port,
            properties,
        )
        .map_err(|e| DiscoveryError::Publish {
            name: registration.name.clone(),
            reason: e.to_string(),
        })?
        .enable_addr_auto();

        let fullname = service_info.get_fullname().to_string();
        self.daemon.register(service_info)?;
        info!("Registered service: {} on port {}", fullname, registration.port);
        Ok(fullname)
    }

    fn unregister(&self, key: &str) -> Result<(), DiscoveryError> {
        self.daemon.unregister(key)?;
        info!("Unregistering service: {}", key);
        Ok(())
    }
}

async fn forward(type_domain: String, receiver: Receiver<ServiceEvent>, browses: Browses) {
    while let Ok(event) = receiver.recv_async().await {
        match event {
            ServiceEvent::ServiceResolved(info) => {
                let fullname = info.get_fullname().to_string();
                let name = instance_name(&fullname, &type_domain);
                let extra = info.get_property_val_str(EXTRA_PROPERTY).map(str::to_string);
                let interfaces = local_ip_address::list_afinet_netifas().unwrap_or_else(|e| {
                    warn!("Can't list local interfaces: {}", e);
                    Vec::new()
                });
                let services: Vec<DiscoveryService> = info
                    .get_addresses()
                    .iter()
                    .filter_map(|ip| ip.to_string().parse::<IpAddr>().ok())
                    .map(|address| {
                        let intf = interface_for(address, &interfaces).unwrap_or_else(|| "unknown".to_string());
                        DiscoveryService::resolved(
                            name.clone(),
                            type_domain.clone(),
                            intf,
                            address,
                            info.get_port(),
                            extra.clone(),
                        )
                    })
                    .collect();

                let mut browses = browses.lock();
                let Some(TypeBrowse { browsers, resolved }) = browses.get_mut(&type_domain) else {
                    break;
                };
                let known = resolved.entry(fullname).or_default();
                for service in services {
                    if service.already_in(known) {
                        continue;
                    }
                    trace!("mDNS resolved {}", service);
                    known.push(service.clone());
                    for events in browsers.values() {
                        let _ = events.send(BackendEvent::Resolved(service.clone()));
                    }
                }
            }
            ServiceEvent::ServiceRemoved(_ty, fullname) => {
                let mut browses = browses.lock();
                let Some(TypeBrowse { browsers, resolved }) = browses.get_mut(&type_domain) else {
                    break;
                };
                for service in resolved.remove(&fullname).unwrap_or_default() {
                    trace!("mDNS removed {}", service);
                    for events in browsers.values() {
                        let _ = events.send(BackendEvent::Removed(service.clone()));
                    }
                }
            }
            ServiceEvent::SearchStopped(_) => break,
            _ => {}
        }
    }
    trace!("mDNS forwarding for '{}' ended", type_domain);
}
