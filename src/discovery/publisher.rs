use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{
    backend, Discover, DiscoveryBackend, DiscoveryService, DiscoveryServicesListener, DiscoveryState,
    DiscoveryStateListener, Registration,
};
use crate::config::DEFAULT_PUBLICATION_WAIT;
use crate::error::DiscoveryError;
use crate::listeners::{ListenerId, Listeners};

struct PublisherInner {
    registration: Registration,
    backend: Arc<dyn DiscoveryBackend>,
    publication_wait: Mutex<Duration>,
    state: Mutex<DiscoveryState>,
    key: Mutex<Option<String>>,
    discover: Mutex<Option<(Discover, ListenerId)>>,
    published: Mutex<Vec<DiscoveryService>>,
    published_count: watch::Sender<usize>,
    state_listeners: Listeners<dyn DiscoveryStateListener>,
}

/// Advertises one service and confirms it by discovering itself.
///
/// The publisher browses its own service type: every interface a service
/// of that type shows up on counts towards [`Publisher::interfaces`], and
/// the services carrying its own name are its confirmed publications.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

impl Publisher {
    pub fn new(
        implementation: &str,
        service_type: impl Into<String>,
        name: impl Into<String>,
        port: u16,
        extra: Option<String>,
    ) -> Result<Self, DiscoveryError> {
        let registration = Registration {
            service_type: service_type.into(),
            name: name.into(),
            port,
            extra,
        };
        Ok(Self::with_backend(backend(implementation)?, registration))
    }

    pub fn with_backend(backend: Arc<dyn DiscoveryBackend>, registration: Registration) -> Self {
        Self {
            inner: Arc::new(PublisherInner {
                registration,
                backend,
                publication_wait: Mutex::new(DEFAULT_PUBLICATION_WAIT),
                state: Mutex::new(DiscoveryState::Stopped),
                key: Mutex::default(),
                discover: Mutex::default(),
                published: Mutex::default(),
                published_count: watch::channel(0).0,
                state_listeners: Listeners::default(),
            }),
        }
    }

    pub fn service_type(&self) -> &str {
        &self.inner.registration.service_type
    }

    pub fn service_name(&self) -> &str {
        &self.inner.registration.name
    }

    pub fn port(&self) -> u16 {
        self.inner.registration.port
    }

    pub fn extra(&self) -> Option<&str> {
        self.inner.registration.extra.as_deref()
    }

    pub fn implementation(&self) -> &'static str {
        self.inner.backend.name()
    }

    pub fn state(&self) -> DiscoveryState {
        *self.inner.state.lock()
    }

    pub fn set_publication_wait(&self, wait: Duration) {
        *self.inner.publication_wait.lock() = wait;
    }

    /// Interfaces on which any service of the published type was seen.
    pub fn interfaces(&self) -> Vec<String> {
        self.inner
            .discover
            .lock()
            .as_ref()
            .map(|(discover, _)| discover.interfaces())
            .unwrap_or_default()
    }

    /// Own services discovered so far, one per interface.
    pub fn published_services(&self) -> Vec<DiscoveryService> {
        self.inner.published.lock().clone()
    }

    pub fn is_published_partially(&self) -> bool {
        self.inner.discover.lock().is_some() && !self.inner.published.lock().is_empty()
    }

    /// Published and seen on every known interface.
    pub fn is_published_fully(&self) -> bool {
        self.is_published_partially() && self.inner.published.lock().len() == self.interfaces().len()
    }

    pub fn add_state_listener(&self, listener: Arc<dyn DiscoveryStateListener>) -> ListenerId {
        self.inner.state_listeners.add(listener)
    }

    pub fn remove_state_listener(&self, id: ListenerId) -> bool {
        self.inner.state_listeners.remove(id)
    }

    fn set_state(&self, state: DiscoveryState) {
        *self.inner.state.lock() = state;
    }

    fn fail(&self, error: &DiscoveryError) {
        warn!("Publisher '{}' fail: {}", self.inner.registration.name, error);
        let error = error.to_string();
        self.inner
            .state_listeners
            .emit(|l| l.on_fail(&self.inner.registration.service_type, &error));
    }

    fn publish_error(&self, reason: impl ToString) -> DiscoveryError {
        DiscoveryError::Publish {
            name: self.inner.registration.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Advertise the service.
    ///
    /// With `wait` this returns once the service discovered itself on at
    /// least one interface, or after the publication wait elapsed.
    pub async fn publish(&self, wait: bool) -> Result<(), DiscoveryError> {
        {
            let mut state = self.inner.state.lock();
            if state.is_running() {
                return Ok(());
            }
            *state = DiscoveryState::Startup;
        }

        let discover = Discover::with_backend(self.inner.backend.clone(), self.service_type());
        let listener = discover.add_services_listener(Arc::new(SelfListener {
            publisher: Arc::downgrade(&self.inner),
        }));
        if let Err(e) = discover.start().await {
            self.set_state(DiscoveryState::Stopped);
            let e = self.publish_error(e);
            self.fail(&e);
            return Err(e);
        }
        *self.inner.discover.lock() = Some((discover.clone(), listener));

        let key = match self.inner.backend.register(&self.inner.registration) {
            Ok(key) => key,
            Err(e) => {
                self.inner.discover.lock().take();
                let _ = discover.stop().await;
                self.set_state(DiscoveryState::Stopped);
                let e = self.publish_error(e);
                self.fail(&e);
                return Err(e);
            }
        };
        *self.inner.key.lock() = Some(key);

        if wait && !self.wait_published(|count| count > 0).await {
            warn!(
                "Service '{}' not self-discovered within {:?}",
                self.inner.registration.name,
                self.publication_wait()
            );
        }

        self.set_state(DiscoveryState::Started);
        info!(
            "Published service '{}' ({}) on port {}",
            self.inner.registration.name, self.inner.registration.service_type, self.inner.registration.port
        );
        self.inner
            .state_listeners
            .emit(|l| l.on_start(&self.inner.registration.service_type));
        Ok(())
    }

    /// Withdraw the service.
    ///
    /// With `wait` this first waits, bounded by the publication wait, until
    /// every self-discovered service was reported lost.
    pub async fn hide(&self, wait: bool) -> Result<(), DiscoveryError> {
        {
            let mut state = self.inner.state.lock();
            if !state.is_running() {
                return Ok(());
            }
            *state = DiscoveryState::Shutdown;
        }

        let mut result = Ok(());
        let key = self.inner.key.lock().take();
        if let Some(key) = key {
            if let Err(e) = self.inner.backend.unregister(&key) {
                self.fail(&e);
                result = Err(e);
            } else if wait && !self.wait_published(|count| count == 0).await {
                warn!(
                    "Service '{}' still self-discovered after {:?}",
                    self.inner.registration.name,
                    self.publication_wait()
                );
            }
        }

        let discover = self.inner.discover.lock().take();
        if let Some((discover, listener)) = discover {
            discover.remove_services_listener(listener);
            if let Err(e) = discover.stop().await {
                debug!("Publisher '{}' internal discover stop: {}", self.inner.registration.name, e);
            }
        }
        self.inner.published.lock().clear();
        self.inner.published_count.send_replace(0);

        self.set_state(DiscoveryState::Stopped);
        info!("Hidden service '{}'", self.inner.registration.name);
        self.inner
            .state_listeners
            .emit(|l| l.on_stop(&self.inner.registration.service_type));
        result
    }

    fn publication_wait(&self) -> Duration {
        *self.inner.publication_wait.lock()
    }

    async fn wait_published(&self, done: impl Fn(usize) -> bool) -> bool {
        let mut published = self.inner.published_count.subscribe();
        let wait = self.publication_wait();
        let reached = tokio::time::timeout(wait, published.wait_for(|count| done(*count))).await;
        matches!(reached, Ok(Ok(_)))
    }
}

struct SelfListener {
    publisher: Weak<PublisherInner>,
}

impl DiscoveryServicesListener for SelfListener {
    fn on_service_discovered(&self, service: &DiscoveryService) {
        let Some(inner) = self.publisher.upgrade() else { return };
        if !service.name.eq_ignore_ascii_case(&inner.registration.name) {
            return;
        }
        let mut published = inner.published.lock();
        if service.already_in(&published) {
            return;
        }
        debug!("Self discovered service '{}'", service);
        published.push(service.clone());
        inner.published_count.send_replace(published.len());
    }

    fn on_service_lost(&self, service: &DiscoveryService) {
        let Some(inner) = self.publisher.upgrade() else { return };
        let mut published = inner.published.lock();
        if let Some(index) = service.position_in(&published) {
            debug!("Self lost service '{}'", service);
            published.remove(index);
            inner.published_count.send_replace(published.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::memory::{MemoryBackend, MemoryBus};

    fn registration(name: &str) -> Registration {
        Registration {
            service_type: "_lanlink._tcp".into(),
            name: name.into(),
            port: 1234,
            extra: Some("v=1".into()),
        }
    }

    #[tokio::test]
    async fn publish_waits_for_self_discovery_and_hide_clears_it() {
        let bus = MemoryBus::with_interfaces(&["eth0", "wlan0"]);
        let publisher = Publisher::with_backend(Arc::new(MemoryBackend::on(bus)), registration("alpha"));
        assert!(!publisher.is_published_partially());

        publisher.publish(true).await.unwrap();
        assert_eq!(publisher.state(), DiscoveryState::Started);
        assert!(publisher.is_published_partially());
        for _ in 0..50 {
            if publisher.is_published_fully() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(publisher.is_published_fully());
        assert_eq!(publisher.published_services()[0].extra.as_deref(), Some("v=1"));

        publisher.hide(true).await.unwrap();
        assert_eq!(publisher.state(), DiscoveryState::Stopped);
        assert!(!publisher.is_published_partially());
        assert!(publisher.interfaces().is_empty());
    }

    #[tokio::test]
    async fn fully_needs_every_known_interface() {
        let bus = MemoryBus::with_interfaces(&["eth0"]);
        let backend = Arc::new(MemoryBackend::on(bus.clone()));
        let publisher = Publisher::with_backend(backend, registration("alpha"));
        publisher.publish(true).await.unwrap();

        // another host is seen on an interface we are not published on
        let foreign = DiscoveryService::resolved(
            "beta",
            "_lanlink._tcp.local.",
            "wlan0",
            "10.0.0.9".parse().unwrap(),
            1234,
            None,
        );
        bus.announce(foreign);
        for _ in 0..50 {
            if publisher.interfaces().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(publisher.is_published_partially());
        assert!(!publisher.is_published_fully());

        bus.announce(DiscoveryService::resolved(
            "ALPHA",
            "_lanlink._tcp.local.",
            "wlan0",
            "10.0.0.3".parse().unwrap(),
            1234,
            None,
        ));
        for _ in 0..50 {
            if publisher.is_published_fully() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(publisher.is_published_fully());
        publisher.hide(false).await.unwrap();
    }

    #[tokio::test]
    async fn publish_without_interfaces_times_out_but_succeeds() {
        let bus = MemoryBus::with_interfaces(&[]);
        let publisher = Publisher::with_backend(Arc::new(MemoryBackend::on(bus)), registration("alpha"));
        publisher.set_publication_wait(Duration::from_millis(50));
        publisher.publish(true).await.unwrap();
        assert!(!publisher.is_published_partially());
        assert!(!publisher.is_published_fully());
        publisher.hide(true).await.unwrap();
    }
}
