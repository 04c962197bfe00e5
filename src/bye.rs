//! Cooperative close handshake.
//!
//! A peer closing on its own sends the bye token before shutting the socket.
//! The remote sees a frame equal to the token and terminates with
//! `RemoteRequest` instead of `ConnectionLost`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::encoding::{Charset, Token};
use crate::listeners::{ListenerId, Listeners};
use crate::peer::Peer;

pub const DEFAULT_BYE_TOKEN: &str = "bye";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ByeMsgConfig {
    pub enabled: bool,
    pub token: Token,
}

impl Default for ByeMsgConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            token: Token::Text(DEFAULT_BYE_TOKEN.to_string()),
        }
    }
}

impl ByeMsgConfig {
    pub fn new(enabled: bool, token: impl Into<Token>) -> Self {
        Self {
            enabled,
            token: token.into(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn set_token_bytes(&mut self, token: Vec<u8>) {
        self.token = Token::Bytes(token);
    }

    pub fn set_token_text(&mut self, token: &str) {
        self.token = Token::Text(token.to_string());
    }

    /// Same field-wise rule as [`crate::heartbeat::HeartBeatConfig::adopt`].
    pub fn adopt(&mut self, prev: &ByeMsgConfig, new: &ByeMsgConfig) {
        if self.enabled == prev.enabled {
            self.enabled = new.enabled;
        }
        if self.token == prev.token {
            self.token = new.token.clone();
        }
    }
}

pub trait ByeMsgListener: Send + Sync {
    /// Called when the remote peer sent the bye token.
    fn on_bye(&self, peer: &Peer);
}

pub(crate) struct ByeMsg {
    config: Mutex<ByeMsgConfig>,
    listeners: Listeners<dyn ByeMsgListener>,
}

impl ByeMsg {
    pub fn new(config: ByeMsgConfig) -> Self {
        Self {
            config: Mutex::new(config),
            listeners: Listeners::default(),
        }
    }

    pub fn config(&self) -> ByeMsgConfig {
        self.config.lock().clone()
    }

    pub fn set_config(&self, config: ByeMsgConfig) {
        *self.config.lock() = config;
    }

    pub fn adopt(&self, prev: &ByeMsgConfig, new: &ByeMsgConfig) {
        self.config.lock().adopt(prev, new);
    }

    /// Token to send on a local disconnect, `None` when disabled.
    pub fn outgoing(&self, charset: Charset) -> Option<Vec<u8>> {
        let config = self.config.lock();
        config.enabled.then(|| config.token.to_bytes(charset))
    }

    /// Exact match only. Checked even when sending is disabled.
    pub fn is_bye(&self, frame: &[u8], charset: Charset) -> bool {
        frame == self.config.lock().token.to_bytes(charset).as_slice()
    }

    pub fn add_listener(&self, listener: Arc<dyn ByeMsgListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    pub fn emit_bye(&self, peer: &Peer) {
        self.listeners.emit(|l| l.on_bye(peer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bye_matches_whole_frame_only() {
        let bye = ByeMsg::new(ByeMsgConfig::default());
        assert!(bye.is_bye(b"bye", Charset::Utf8));
        assert!(!bye.is_bye(b"bye!", Charset::Utf8));
        assert!(!bye.is_bye(b"by", Charset::Utf8));
    }

    #[test]
    fn disabled_bye_is_not_sent_but_still_recognised() {
        let bye = ByeMsg::new(ByeMsgConfig::disabled());
        assert_eq!(bye.outgoing(Charset::Utf8), None);
        assert!(bye.is_bye(b"bye", Charset::Utf8));
    }

    #[test]
    fn token_forms_replace_each_other() {
        let mut cfg = ByeMsgConfig::default();
        cfg.set_token_bytes(vec![0x00, 0xFF]);
        assert_eq!(cfg.token, Token::Bytes(vec![0x00, 0xFF]));
        cfg.set_token_text("ciao");
        assert_eq!(cfg.token.to_bytes(Charset::Utf8), b"ciao".to_vec());
    }

    #[test]
    fn adopt_keeps_local_token_override() {
        let prev = ByeMsgConfig::default();
        let new = ByeMsgConfig::new(false, "farewell");

        let mut local = ByeMsgConfig::new(true, "custom");
        local.adopt(&prev, &new);
        assert!(!local.enabled);
        assert_eq!(local.token, Token::from("custom"));

        let mut inherited = prev.clone();
        inherited.adopt(&prev, &new);
        assert_eq!(inherited, new);
    }
}
