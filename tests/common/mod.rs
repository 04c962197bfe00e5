#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lanlink::peer::{DataProcessor, Peer, PeerConnectionListener, PeerDataListener};
use parking_lot::Mutex;

/// Records connection and data events as short strings.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    pub fn received(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.strip_prefix("rx ").map(str::to_string))
            .collect()
    }

    fn push(&self, event: String) {
        self.events.lock().push(event);
    }
}

impl PeerConnectionListener for Recorder {
    fn on_connect(&self, _peer: &Peer) {
        self.push("connect".into());
    }

    fn on_disconnect(&self, peer: &Peer) {
        self.push(format!("disconnect {:?}", peer.disconnection_reason()));
    }

    fn on_fail(&self, _peer: &Peer, error: &str) {
        self.push(format!("fail {}", error));
    }
}

impl PeerDataListener for Recorder {
    fn on_data_rx(&self, _peer: &Peer, data: &[u8]) {
        self.push(format!("rx {}", String::from_utf8_lossy(data)));
    }
}

pub fn accept_all() -> Arc<dyn DataProcessor> {
    Arc::new(|_: &Peer, _: &str| true)
}

/// Poll `check` for up to two seconds.
pub async fn until(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
