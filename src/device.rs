//! Virtual network interface boundary.
//!
//! The host operating system owns interface creation and packet I/O; the core
//! only prepares builder-style configurations and talks to the established
//! interface through a duplex packet channel. Exactly two configurations are
//! prepared per reconnect cycle (routed and unrouted) and at most one
//! interface is established at a time.

use std::io;
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::sync::Notify;

use crate::error::Result;
use crate::tunnel::TunnelSpec;

/// Builder-style configuration for the host's virtual interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Interface MTU.
    pub mtu: u16,
    /// Local tunnel address.
    pub address: Ipv6Addr,
    /// Prefix length for the local address.
    pub prefix_len: u8,
    /// Routes to install through the interface.
    pub routes: Vec<(Ipv6Addr, u8)>,
    /// DNS servers reachable through the tunnel.
    pub dns: Vec<Ipv6Addr>,
}

/// Well-known public IPv6 resolvers offered when the tunnel carries all
/// IPv6 traffic.
const TUNNEL_DNS: [Ipv6Addr; 2] = [
    Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8888),
    Ipv6Addr::new(0x2001, 0x4860, 0x4860, 0, 0, 0, 0, 0x8844),
];

impl InterfaceConfig {
    /// Configuration for when the tunnel must carry all IPv6 traffic:
    /// installs the default route.
    pub fn routed(spec: &TunnelSpec) -> Self {
        Self {
            mtu: spec.mtu,
            address: spec.client_v6,
            prefix_len: spec.prefix_len,
            routes: vec![(Ipv6Addr::UNSPECIFIED, 0)],
            dns: TUNNEL_DNS.to_vec(),
        }
    }

    /// Configuration for when native IPv6 already exists: suppresses the
    /// default route and only routes the tunnel prefix.
    pub fn unrouted(spec: &TunnelSpec) -> Self {
        Self {
            mtu: spec.mtu,
            address: spec.client_v6,
            prefix_len: spec.prefix_len,
            routes: vec![(spec.pop_v6, spec.prefix_len)],
            dns: Vec::new(),
        }
    }
}

/// Duplex packet channel of an established interface.
///
/// `read_packet` returning zero bytes means "no data yet", not end of
/// stream. `close` must unblock any reader or writer.
#[async_trait]
pub trait PacketDevice: Send + Sync {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize>;
    async fn write_packet(&self, packet: &[u8]) -> io::Result<usize>;
    async fn close(&self);
}

/// Host-side factory that turns a configuration into an established
/// interface.
#[async_trait]
pub trait InterfaceFactory: Send + Sync {
    async fn establish(&self, config: &InterfaceConfig) -> Result<Arc<dyn PacketDevice>>;
}

/// In-process packet device over channels.
///
/// Two paired halves form a loopback: packets written to one half are read
/// from the other. Used by tests and embedders that feed packets directly.
pub struct MemoryDevice {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

/// Create a connected pair of in-process devices.
pub fn memory_pair() -> (Arc<MemoryDevice>, Arc<MemoryDevice>) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    let a = Arc::new(MemoryDevice {
        tx: a_tx,
        rx: Mutex::new(b_rx),
        closed: AtomicBool::new(false),
        close_notify: Notify::new(),
    });
    let b = Arc::new(MemoryDevice {
        tx: b_tx,
        rx: Mutex::new(a_rx),
        closed: AtomicBool::new(false),
        close_notify: Notify::new(),
    });
    (a, b)
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device closed")
}

#[async_trait]
impl PacketDevice for MemoryDevice {
    async fn read_packet(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_err());
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.close_notify.notified() => Err(closed_err()),
            packet = rx.recv() => match packet {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => Err(closed_err()),
            },
        }
    }

    async fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(closed_err());
        }
        self.tx
            .send(packet.to_vec())
            .await
            .map_err(|_| closed_err())?;
        Ok(packet.len())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TunnelSpec {
        let mut builder = crate::tunnel::TunnelSpecBuilder::new();
        for line in [
            "TunnelId: T1",
            "Type: ayiya",
            "IPv6 Endpoint: 2001:db8::2",
            "IPv6 PoP: 2001:db8::1",
            "IPv6 PrefixLength: 64",
            "Tunnel MTU: 1428",
            "Enabled: true",
            "Valid: true",
        ] {
            builder.apply_line(line);
        }
        builder.build().unwrap()
    }

    #[test]
    fn test_two_variant_configs() {
        let spec = spec();
        let routed = InterfaceConfig::routed(&spec);
        let unrouted = InterfaceConfig::unrouted(&spec);

        assert_eq!(routed.routes, vec![(Ipv6Addr::UNSPECIFIED, 0)]);
        assert!(!routed.dns.is_empty());
        assert!(unrouted.routes.iter().all(|(_, len)| *len > 0));
        assert!(unrouted.dns.is_empty());
        assert_eq!(routed.mtu, unrouted.mtu);
    }

    #[tokio::test]
    async fn test_memory_pair_round_trip() {
        let (a, b) = memory_pair();
        a.write_packet(b"ping").await.unwrap();
        let mut buf = [0u8; 16];
        let n = b.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_close_unblocks_reader() {
        let (a, _b) = memory_pair();
        let reader = {
            let a = a.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 16];
                a.read_packet(&mut buf).await
            })
        };
        tokio::task::yield_now().await;
        a.close().await;
        let result = reader.await.unwrap();
        assert!(result.is_err());
    }
}
