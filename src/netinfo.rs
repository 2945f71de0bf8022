//! Native network information boundary.
//!
//! The host delivers network-change notifications asynchronously. They only
//! update cached state and wake waiters; nothing on this path performs
//! blocking I/O.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::debug;

/// Snapshot of the device's non-VPN network connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    /// Any native connectivity at all.
    pub connected: bool,
    /// The native network is cellular (radio/battery constrained).
    pub cellular: bool,
    /// A native IPv6 default route exists.
    pub native_ipv6: bool,
}

impl NetworkState {
    /// A disconnected device.
    pub const DOWN: NetworkState = NetworkState {
        connected: false,
        cellular: false,
        native_ipv6: false,
    };
}

/// Host-side handle: push updated network state into the core.
pub struct NetworkNotifier {
    tx: watch::Sender<NetworkState>,
}

impl NetworkNotifier {
    /// Publish a new state, waking any waiters. Never blocks.
    pub fn update(&self, state: NetworkState) {
        self.tx.send_replace(state);
    }
}

/// Core-side handle: query and await native network state.
#[derive(Clone)]
pub struct NetworkWatch {
    rx: watch::Receiver<NetworkState>,
}

impl NetworkWatch {
    /// Latest known state.
    pub fn current(&self) -> NetworkState {
        *self.rx.borrow()
    }

    /// Block until the device reports connectivity.
    pub async fn wait_connected(&mut self) {
        // An Err means the notifier is gone; treat the last state as final.
        let _ = self.rx.wait_for(|state| state.connected).await;
    }

    /// Wait for any state change.
    pub async fn changed(&mut self) {
        let _ = self.rx.changed().await;
    }
}

/// Create a linked notifier/watch pair.
pub fn network_channel(initial: NetworkState) -> (NetworkNotifier, NetworkWatch) {
    let (tx, rx) = watch::channel(initial);
    (NetworkNotifier { tx }, NetworkWatch { rx })
}

/// Direct reachability probe used to distinguish "tunnel stalled" from
/// "device offline".
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Whether the probe target answered.
    async fn probe(&self) -> bool;
}

/// Default well-known IPv6 probe target (public resolver, DNS port).
pub const DEFAULT_PROBE_ADDR: SocketAddr = SocketAddr::new(
    IpAddr::V6(Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888)),
    53,
);

/// Bounded TCP connect probe.
pub struct TcpProbe {
    pub addr: SocketAddr,
    pub timeout: Duration,
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self {
            addr: DEFAULT_PROBE_ADDR,
            timeout: Duration::from_secs(5),
        }
    }
}

#[async_trait]
impl Reachability for TcpProbe {
    async fn probe(&self) -> bool {
        match timeout(self.timeout, TcpStream::connect(self.addr)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(addr = %self.addr, error = %e, "reachability probe failed");
                false
            }
            Err(_) => {
                debug!(addr = %self.addr, "reachability probe timed out");
                false
            }
        }
    }
}
