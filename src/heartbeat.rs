//! Heartbeat liveness probe.
//!
//! A read that times out after [`HeartBeatConfig::timeout`] with no probe
//! outstanding sends [`HB_REQUEST`]. A waiter then gives the remote
//! [`HeartBeatConfig::hb_timeout`] to answer with [`HB_RESPONSE`]; if it does
//! not, the peer disconnects with `HeartbeatTimeout`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::warn;

use crate::config::duration_ms;
use crate::encoding::Charset;
use crate::listeners::{ListenerId, Listeners};
use crate::peer::Peer;

pub const HB_REQUEST: &str = "hb_rq";
pub const HB_RESPONSE: &str = "hb_rs";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_HB_TIMEOUT: Duration = Duration::from_millis(5_000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartBeatConfig {
    /// Socket read timeout; an idle read this long triggers a probe.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Maximum wait for the probe's response.
    #[serde(with = "duration_ms")]
    pub hb_timeout: Duration,
    /// Whether incoming probes are answered.
    pub response_enabled: bool,
}

impl Default for HeartBeatConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            hb_timeout: DEFAULT_HB_TIMEOUT,
            response_enabled: true,
        }
    }
}

impl HeartBeatConfig {
    /// Build a config keeping `hb_timeout` at least 10% below `timeout`.
    ///
    /// A larger `hb_timeout` is lowered to `timeout - timeout / 10` with a warning.
    pub fn new(timeout: Duration, hb_timeout: Duration, response_enabled: bool) -> Self {
        Self {
            timeout,
            hb_timeout,
            response_enabled,
        }
        .normalized()
    }

    pub fn normalized(mut self) -> Self {
        let max_hb = self.timeout - self.timeout / 10;
        if self.hb_timeout > max_hb {
            warn!(
                "HeartBeat timeout ({:?}) can't be greater than network timeout ({:?}) minus 10%, reset heartbeat timeout to {:?}",
                self.hb_timeout, self.timeout, max_hb
            );
            self.hb_timeout = max_hb;
        }
        self
    }

    /// Adopt each field of `new` that still equals the matching field of `prev`.
    ///
    /// Fields that differ from `prev` were overridden locally and are kept.
    pub fn adopt(&mut self, prev: &HeartBeatConfig, new: &HeartBeatConfig) {
        if self.timeout == prev.timeout {
            self.timeout = new.timeout;
        }
        if self.hb_timeout == prev.hb_timeout {
            self.hb_timeout = new.hb_timeout;
        }
        if self.response_enabled == prev.response_enabled {
            self.response_enabled = new.response_enabled;
        }
    }
}

/// Observer of a peer's heartbeat exchanges.
pub trait HeartBeatListener: Send + Sync {
    fn on_send(&self, _peer: &Peer) {}
    fn on_success(&self, _peer: &Peer) {}
    fn on_fail(&self, _peer: &Peer) {}
}

/// Classification of an inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeartBeatFrame {
    Request,
    Response,
}

/// Per-peer heartbeat state. At most one probe is outstanding at a time.
pub(crate) struct HeartBeat {
    config: Mutex<HeartBeatConfig>,
    pending: Mutex<Option<oneshot::Sender<()>>>,
    timeout_expired: AtomicBool,
    listeners: Listeners<dyn HeartBeatListener>,
}

impl HeartBeat {
    pub fn new(config: HeartBeatConfig) -> Self {
        Self {
            config: Mutex::new(config.normalized()),
            pending: Mutex::new(None),
            timeout_expired: AtomicBool::new(false),
            listeners: Listeners::default(),
        }
    }

    pub fn config(&self) -> HeartBeatConfig {
        *self.config.lock()
    }

    pub fn set_config(&self, config: HeartBeatConfig) {
        *self.config.lock() = config.normalized();
    }

    pub fn adopt(&self, prev: &HeartBeatConfig, new: &HeartBeatConfig) {
        let mut config = self.config.lock();
        config.adopt(prev, new);
        *config = config.normalized();
    }

    pub fn is_waiting(&self) -> bool {
        self.pending.lock().is_some()
    }

    pub fn is_timeout_expired(&self) -> bool {
        self.timeout_expired.load(Ordering::SeqCst)
    }

    pub fn set_timeout_expired(&self) {
        self.timeout_expired.store(true, Ordering::SeqCst);
    }

    /// Reserve the single probe slot. `None` when a probe is already outstanding.
    pub fn begin(&self) -> Option<oneshot::Receiver<()>> {
        let mut pending = self.pending.lock();
        if pending.is_some() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        *pending = Some(tx);
        self.timeout_expired.store(false, Ordering::SeqCst);
        Some(rx)
    }

    /// Release the probe slot without resolving it.
    pub fn cancel(&self) {
        self.pending.lock().take();
    }

    /// Resolve the outstanding probe. False when nothing was waiting.
    pub fn acknowledge(&self) -> bool {
        match self.pending.lock().take() {
            Some(tx) => {
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }

    pub fn classify(&self, frame: &[u8], charset: Charset) -> Option<HeartBeatFrame> {
        if self.is_waiting() && frame == charset.encode(HB_RESPONSE).as_ref() {
            return Some(HeartBeatFrame::Response);
        }
        if self.config.lock().response_enabled && frame == charset.encode(HB_REQUEST).as_ref() {
            return Some(HeartBeatFrame::Request);
        }
        None
    }

    pub fn add_listener(&self, listener: Arc<dyn HeartBeatListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn emit_send(&self, peer: &Peer) {
        self.listeners.emit(|l| l.on_send(peer));
    }

    pub fn emit_success(&self, peer: &Peer) {
        self.listeners.emit(|l| l.on_success(peer));
    }

    pub fn emit_fail(&self, peer: &Peer) {
        self.listeners.emit(|l| l.on_fail(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hb_timeout_is_clamped_below_timeout() {
        let cfg = HeartBeatConfig::new(Duration::from_millis(200), Duration::from_millis(300), true);
        assert_eq!(cfg.hb_timeout, Duration::from_millis(180));

        let cfg = HeartBeatConfig::new(Duration::from_millis(200), Duration::from_millis(100), true);
        assert_eq!(cfg.hb_timeout, Duration::from_millis(100));
    }

    #[test]
    fn adopt_skips_overridden_fields() {
        let prev = HeartBeatConfig::default();
        let new = HeartBeatConfig::new(Duration::from_millis(1234), Duration::from_millis(1000), false);

        let mut untouched = prev;
        untouched.adopt(&prev, &new);
        assert_eq!(untouched, new);

        let mut overridden = prev;
        overridden.timeout = Duration::from_millis(999);
        overridden.adopt(&prev, &new);
        assert_eq!(overridden.timeout, Duration::from_millis(999));
        assert_eq!(overridden.hb_timeout, Duration::from_millis(1000));
        assert!(!overridden.response_enabled);
    }

    #[test]
    fn only_one_probe_outstanding() {
        let hb = HeartBeat::new(HeartBeatConfig::default());
        let first = hb.begin();
        assert!(first.is_some());
        assert!(hb.begin().is_none());
        assert!(hb.is_waiting());

        assert!(hb.acknowledge());
        assert!(!hb.is_waiting());
        assert!(!hb.acknowledge());
        assert!(hb.begin().is_some());
    }

    #[test]
    fn response_only_recognised_while_waiting() {
        let hb = HeartBeat::new(HeartBeatConfig::default());
        assert_eq!(hb.classify(b"hb_rs", Charset::Utf8), None);
        assert_eq!(hb.classify(b"hb_rq", Charset::Utf8), Some(HeartBeatFrame::Request));

        let _rx = hb.begin();
        assert_eq!(hb.classify(b"hb_rs", Charset::Utf8), Some(HeartBeatFrame::Response));

        hb.set_config(HeartBeatConfig {
            response_enabled: false,
            ..HeartBeatConfig::default()
        });
        assert_eq!(hb.classify(b"hb_rq", Charset::Utf8), None);
    }

    #[test]
    fn config_serializes_durations_as_millis() {
        let json = serde_json::to_value(HeartBeatConfig::default()).unwrap();
        assert_eq!(json["timeout"], 30_000);
        assert_eq!(json["hb_timeout"], 5_000);
    }
}
