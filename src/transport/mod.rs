//! Encapsulated transport sessions.
//!
//! Both encapsulations (AYIYA-over-UDP and DTLS-over-UDP) sit behind one
//! contract so the forwarder and monitor never care which one is active.

mod ayiya;
mod dtls;

pub use ayiya::AyiyaTransport;
pub use dtls::DtlsTransport;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::tunnel::{TunnelKind, TunnelSpec};

/// One tunnel transport session.
///
/// A session is created per reconnect attempt and never reused after
/// `close`. `send`/`recv` are valid only after a successful `connect`;
/// `connect` itself may be retried after failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the session (bind/connect sockets, handshakes).
    async fn connect(&self) -> Result<()>;

    /// Encapsulate and send one IPv6 packet.
    async fn send(&self, payload: &[u8]) -> Result<usize>;

    /// Receive the next valid decapsulated IPv6 packet.
    ///
    /// Inbound frames that fail authentication are dropped and logged, not
    /// surfaced as errors.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send a protocol-level heartbeat. Fails with [`Error::TunnelBroken`]
    /// when the transport has detected it cannot send.
    async fn beat(&self) -> Result<()>;

    /// Whether at least one authenticated inbound packet arrived this
    /// session. Flips once, permanently.
    fn valid_packet_received(&self) -> bool;

    /// Time since the last outbound packet (or session start).
    fn last_sent_age(&self) -> Duration;

    /// Time since the last valid inbound packet (or session start).
    fn last_received_age(&self) -> Duration;

    /// Tear the session down. Safe to call repeatedly; unblocks readers.
    async fn close(&self);
}

/// Shared last-activity bookkeeping for transport implementations.
///
/// Timestamps are milliseconds since the session epoch, owned by whichever
/// task sends or receives; observers only ever read.
pub struct ActivityClock {
    epoch: Instant,
    sent_ms: AtomicU64,
    received_ms: AtomicU64,
    valid: AtomicBool,
}

impl ActivityClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            sent_ms: AtomicU64::new(0),
            received_ms: AtomicU64::new(0),
            valid: AtomicBool::new(false),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn mark_sent(&self) {
        self.sent_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub fn mark_received(&self) {
        self.received_ms.store(self.now_ms(), Ordering::Relaxed);
        self.valid.store(true, Ordering::Relaxed);
    }

    pub fn valid_packet_received(&self) -> bool {
        self.valid.load(Ordering::Relaxed)
    }

    pub fn sent_age(&self) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(self.sent_ms.load(Ordering::Relaxed)))
    }

    pub fn received_age(&self) -> Duration {
        Duration::from_millis(
            self.now_ms()
                .saturating_sub(self.received_ms.load(Ordering::Relaxed)),
        )
    }
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the transport matching a tunnel's encapsulation type.
pub fn create(spec: &TunnelSpec, config: &Config) -> Result<Arc<dyn Transport>> {
    match spec.kind {
        TunnelKind::Ayiya => Ok(Arc::new(AyiyaTransport::new(spec))),
        TunnelKind::Dtls => {
            let dtls = config
                .dtls
                .as_ref()
                .ok_or_else(|| Error::config("tunnel requires DTLS credentials"))?;
            Ok(Arc::new(DtlsTransport::new(spec, dtls)?))
        }
    }
}
