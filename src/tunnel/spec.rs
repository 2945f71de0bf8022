//! Tunnel specification as handed out by the broker.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Link-layer MTU bounds for an IPv6 tunnel.
pub const MIN_MTU: u16 = 1280;
pub const MAX_MTU: u16 = 1500;

/// Supported encapsulation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelKind {
    /// AYIYA over UDP with a signed header.
    Ayiya,
    /// DTLS over UDP with a client certificate.
    Dtls,
}

impl std::fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelKind::Ayiya => write!(f, "ayiya"),
            TunnelKind::Dtls => write!(f, "dtls"),
        }
    }
}

/// A tunnel description, immutable once parsed from broker data.
///
/// Equality and hashing go by `id` only; the broker never hands out two
/// descriptions with the same id and different parameters within one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelSpec {
    /// Broker-assigned tunnel identifier (e.g. "T12345").
    pub id: String,
    /// Broker-assigned display name.
    pub name: String,
    /// Encapsulation type.
    pub kind: TunnelKind,
    /// PoP endpoint terminating the tunnel, IPv4 side.
    pub pop_v4: Ipv4Addr,
    /// PoP endpoint, IPv6 side.
    pub pop_v6: Ipv6Addr,
    /// Our end of the tunnel.
    pub client_v6: Ipv6Addr,
    /// Prefix length of the routed network.
    pub prefix_len: u8,
    /// Tunnel MTU.
    pub mtu: u16,
    /// Heartbeat interval in seconds.
    pub heartbeat_secs: u64,
    /// Shared secret for AYIYA packet signing.
    #[serde(default)]
    pub password: String,
    /// Administratively enabled.
    pub enabled: bool,
    /// Description passed broker-side validation.
    pub valid: bool,
    /// Creation time, unix seconds.
    #[serde(default)]
    pub created: u64,
    /// Expiry time, unix seconds; 0 means no expiry.
    #[serde(default)]
    pub expiry: u64,
}

impl PartialEq for TunnelSpec {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TunnelSpec {}

impl std::hash::Hash for TunnelSpec {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl TunnelSpec {
    /// Heartbeat interval as a duration.
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    /// Whether this tunnel may be used: valid, enabled, supported type.
    pub fn is_suitable(&self) -> bool {
        self.valid && self.enabled
    }

    /// Age of the tunnel description relative to its creation stamp.
    pub fn age(&self) -> Duration {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Duration::from_secs(now.saturating_sub(self.created))
    }
}

/// Accumulates `Key: value` lines from a `tunnel show` response.
#[derive(Debug, Default)]
pub struct TunnelSpecBuilder {
    id: Option<String>,
    name: Option<String>,
    kind: Option<TunnelKind>,
    unsupported_kind: Option<String>,
    pop_v4: Option<Ipv4Addr>,
    pop_v6: Option<Ipv6Addr>,
    client_v6: Option<Ipv6Addr>,
    prefix_len: Option<u8>,
    mtu: Option<u16>,
    heartbeat_secs: Option<u64>,
    password: Option<String>,
    enabled: Option<bool>,
    valid: Option<bool>,
    created: Option<u64>,
    expiry: Option<u64>,
}

impl TunnelSpecBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one `Key: value` line. Unknown keys and unparseable values are
    /// logged and skipped; they are not fatal.
    pub fn apply_line(&mut self, line: &str) {
        let Some((key, value)) = line.split_once(':') else {
            debug!(line, "skipping malformed tunnel description line");
            return;
        };
        let key = key.trim();
        let value = value.trim();

        match key {
            "TunnelId" => self.id = Some(value.to_string()),
            "Tunnel Name" => self.name = Some(value.to_string()),
            "Type" => match value.to_ascii_lowercase().as_str() {
                "ayiya" => self.kind = Some(TunnelKind::Ayiya),
                "dtls" => self.kind = Some(TunnelKind::Dtls),
                other => self.unsupported_kind = Some(other.to_string()),
            },
            "IPv4 PoP" => self.parse_into(value, key, |b, v| b.pop_v4 = Some(v)),
            "IPv6 PoP" => self.parse_into(value, key, |b, v| b.pop_v6 = Some(v)),
            "IPv6 Endpoint" => self.parse_into(value, key, |b, v| b.client_v6 = Some(v)),
            "IPv6 PrefixLength" => self.parse_into(value, key, |b, v| b.prefix_len = Some(v)),
            "Tunnel MTU" => self.parse_into(value, key, |b, v| b.mtu = Some(v)),
            "Heartbeat_Interval" => self.parse_into(value, key, |b, v| b.heartbeat_secs = Some(v)),
            "Password" => self.password = Some(value.to_string()),
            "Enabled" => self.parse_into(value, key, |b, v| b.enabled = Some(v)),
            "Valid" => self.parse_into(value, key, |b, v| b.valid = Some(v)),
            "Created" => self.parse_into(value, key, |b, v| b.created = Some(v)),
            "Expiry" => self.parse_into(value, key, |b, v| b.expiry = Some(v)),
            _ => debug!(key, "skipping unknown tunnel description key"),
        }
    }

    fn parse_into<T: std::str::FromStr>(
        &mut self,
        value: &str,
        key: &str,
        set: impl FnOnce(&mut Self, T),
    ) {
        match value.parse::<T>() {
            Ok(v) => set(self, v),
            Err(_) => debug!(key, value, "skipping unparseable tunnel description value"),
        }
    }

    /// Finish the description, enforcing the TunnelSpec invariants.
    pub fn build(self) -> Result<TunnelSpec> {
        if let Some(kind) = self.unsupported_kind {
            return Err(Error::UnsupportedTunnelType(kind));
        }
        let id = self
            .id
            .ok_or_else(|| Error::Unexpected("tunnel description without TunnelId".into()))?;
        let kind = self.kind.ok_or_else(|| {
            Error::Unexpected(format!("tunnel {id} description without Type"))
        })?;

        let mtu = self.mtu.unwrap_or(MIN_MTU);
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(Error::Unexpected(format!(
                "tunnel {id} MTU {mtu} outside {MIN_MTU}..={MAX_MTU}"
            )));
        }
        let heartbeat_secs = self.heartbeat_secs.unwrap_or(120);
        if heartbeat_secs == 0 {
            return Err(Error::Unexpected(format!(
                "tunnel {id} heartbeat interval must be positive"
            )));
        }

        Ok(TunnelSpec {
            name: self.name.unwrap_or_else(|| id.clone()),
            kind,
            pop_v4: self.pop_v4.unwrap_or(Ipv4Addr::UNSPECIFIED),
            pop_v6: self.pop_v6.unwrap_or(Ipv6Addr::UNSPECIFIED),
            client_v6: self.client_v6.unwrap_or(Ipv6Addr::UNSPECIFIED),
            prefix_len: self.prefix_len.unwrap_or(64),
            mtu,
            heartbeat_secs,
            password: self.password.unwrap_or_default(),
            enabled: self.enabled.unwrap_or(false),
            valid: self.valid.unwrap_or(false),
            created: self.created.unwrap_or(0),
            expiry: self.expiry.unwrap_or(0),
            id,
        })
    }
}
