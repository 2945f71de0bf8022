//! Configuration for the tunnel client.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::DEFAULT_TIC_PORT;

/// Top-level client configuration (JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel broker settings.
    pub broker: BrokerSettings,

    /// Tunnel behaviour settings.
    #[serde(default)]
    pub tunnel: TunnelSettings,

    /// DTLS credentials; required only for tunnels of type `dtls`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dtls: Option<DtlsSettings>,

    /// Path to the persisted tunnel catalog cache.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<PathBuf>,
}

/// Broker connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Broker hostname or IP address.
    pub host: String,

    /// Broker TCP port (default: 3874).
    #[serde(default = "default_tic_port")]
    pub port: u16,

    /// Username for authentication.
    pub username: String,

    /// Password for challenge/response authentication.
    pub password: String,

    /// Per-exchange socket timeout in seconds (default: 10).
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl BrokerSettings {
    /// Per-exchange socket timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tunnel behaviour settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelSettings {
    /// Preferred tunnel id; breaks ties when several suitable tunnels exist.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred: Option<String>,

    /// Route all IPv6 traffic through the tunnel even when a native IPv6
    /// default route exists.
    #[serde(default)]
    pub force_routed: bool,
}

/// DTLS client credentials (PEM files).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtlsSettings {
    /// Client certificate chain, PEM.
    pub cert_file: PathBuf,

    /// Client private key, PEM.
    pub key_file: PathBuf,

    /// Expected server name; defaults to the PoP IPv4 address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,

    /// Skip server certificate verification. PoPs commonly present
    /// self-signed certificates.
    #[serde(default = "default_true")]
    pub insecure_skip_verify: bool,
}

fn default_tic_port() -> u16 {
    DEFAULT_TIC_PORT
}

fn default_timeout_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::config(format!("cannot read {}: {e}", path.as_ref().display()))
        })?;
        let config: Config =
            serde_json::from_str(&data).map_err(|e| Error::config(format!("bad JSON: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.broker.host.is_empty() {
            return Err(Error::config("broker.host must not be empty"));
        }
        if self.broker.username.is_empty() {
            return Err(Error::config("broker.username must not be empty"));
        }
        if self.broker.timeout_secs == 0 {
            return Err(Error::config("broker.timeout_secs must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let json = r#"{
            "broker": {
                "host": "tic.example.net",
                "username": "XYZ1-TIC",
                "password": "s3cr3t"
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        config.validate().unwrap();
        assert_eq!(config.broker.port, DEFAULT_TIC_PORT);
        assert_eq!(config.broker.timeout(), Duration::from_secs(10));
        assert!(!config.tunnel.force_routed);
        assert!(config.dtls.is_none());
    }

    #[test]
    fn test_validate_rejects_empty_user() {
        let json = r#"{
            "broker": { "host": "h", "username": "", "password": "p" }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_round_trip() {
        let json = r#"{
            "broker": { "host": "h", "port": 1234, "username": "u", "password": "p" },
            "tunnel": { "preferred": "T1", "force_routed": true },
            "cache_file": "/var/lib/sixtun/catalog.json"
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        let back: Config = serde_json::from_str(&serde_json::to_string(&config).unwrap()).unwrap();
        assert_eq!(back.broker.port, 1234);
        assert_eq!(back.tunnel.preferred.as_deref(), Some("T1"));
        assert!(back.tunnel.force_routed);
    }
}
