//! Peer behaviour and node configuration.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bye::ByeMsgConfig;
use crate::encoding::DataEncoding;
use crate::error::ConfigError;
use crate::heartbeat::HeartBeatConfig;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(5_000);
pub const DEFAULT_CERT_SHARING_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_PUBLICATION_WAIT: Duration = Duration::from_millis(5_000);

/// (De)serializes a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// Everything a single connection endpoint needs to know about framing and
/// its heartbeat/bye behaviours.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub encoding: DataEncoding,
    pub heartbeat: HeartBeatConfig,
    pub bye: ByeMsgConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoReconnect {
    pub enabled: bool,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl Default for AutoReconnect {
    fn default() -> Self {
        Self {
            enabled: false,
            delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub trust_store_file: Option<PathBuf>,
    /// Trust any certificate presented for the first time.
    pub auto_trust: bool,
    pub require_client_auth: bool,
    pub cert_sharing: bool,
    #[serde(with = "duration_ms")]
    pub cert_sharing_timeout: Duration,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            cert_file: None,
            key_file: None,
            trust_store_file: None,
            auto_trust: false,
            require_client_auth: false,
            cert_sharing: true,
            cert_sharing_timeout: DEFAULT_CERT_SHARING_TIMEOUT,
        }
    }
}

/// Binary-level settings, persisted as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,
    pub listen: SocketAddr,
    pub protocol: String,
    /// `auto`, `mdns` or `memory`.
    pub discovery: String,
    pub service_type: String,
    pub service_name: Option<String>,
    pub local_only: bool,
    pub reconnect: AutoReconnect,
    pub tls: TlsSettings,
    pub peer: PeerConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: format!("node-{}", uuid::Uuid::new_v4().simple()),
            listen: SocketAddr::from(([0, 0, 0, 0], 1234)),
            protocol: "tcp".to_string(),
            discovery: "auto".to_string(),
            service_type: "_lanlink._tcp".to_string(),
            service_name: None,
            local_only: false,
            reconnect: AutoReconnect::default(),
            tls: TlsSettings::default(),
            peer: PeerConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Read `path`, falling back to defaults if it is missing or unreadable.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config {}: {}, using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::Charset;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PeerConfig::default();
        assert_eq!(cfg.encoding.charset, Charset::Utf8);
        assert_eq!(cfg.encoding.delimiter_bytes(), b"\n".to_vec());
        assert_eq!(cfg.heartbeat.timeout, Duration::from_millis(30_000));
        assert_eq!(cfg.heartbeat.hb_timeout, Duration::from_millis(5_000));
        assert!(cfg.heartbeat.response_enabled);
        assert!(cfg.bye.enabled);

        let reconnect = AutoReconnect::default();
        assert!(!reconnect.enabled);
        assert_eq!(reconnect.delay, Duration::from_millis(5_000));
    }

    #[test]
    fn save_then_load_keeps_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("node.json");

        let mut cfg = NodeConfig::default();
        cfg.node_id = "kitchen-lamp".into();
        cfg.tls.enabled = true;
        cfg.peer.heartbeat = HeartBeatConfig::new(Duration::from_millis(200), Duration::from_millis(100), false);
        cfg.save_to_file(&path).unwrap();

        let loaded = NodeConfig::load_or_default(&path);
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn corrupt_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.json");
        fs::write(&path, "{ not json").unwrap();

        let loaded = NodeConfig::load_or_default(&path);
        assert_eq!(loaded.protocol, "tcp");
        assert!(NodeConfig::load(&path).is_err());
    }

    #[test]
    fn partial_json_fills_missing_fields() {
        let cfg: PeerConfig = serde_json::from_str(r#"{"heartbeat":{"timeout":1000}}"#).unwrap();
        assert_eq!(cfg.heartbeat.timeout, Duration::from_millis(1000));
        assert_eq!(cfg.heartbeat.hb_timeout, Duration::from_millis(5_000));
        assert_eq!(cfg.bye, ByeMsgConfig::default());
    }
}
