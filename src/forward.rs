//! Packet forwarding between the virtual interface and the transport.
//!
//! Two copy loops run per session, one per direction. They share a bounded
//! buffer pool so a stalled peer cannot make the forwarder allocate without
//! limit. Either loop dying force-closes both endpoints, which unblocks the
//! other loop; the first failure is kept as the session's death cause.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::device::PacketDevice;
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Forwarding loop tuning.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Number of pooled packet buffers.
    pub pool_size: usize,
    /// Size of each pooled buffer.
    pub buffer_size: usize,
    /// First sleep after a zero-byte device read.
    pub backoff_start: Duration,
    /// Longest sleep between zero-byte device reads.
    pub backoff_cap: Duration,
    /// Consecutive zero-byte reads before the single idle warning.
    pub zero_read_warning: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            buffer_size: 32 * 1024,
            backoff_start: Duration::from_millis(100),
            backoff_cap: Duration::from_secs(10),
            zero_read_warning: 10_000,
        }
    }
}

/// Forwarding direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to transport.
    Upstream,
    /// Transport to device.
    Downstream,
}

/// Bounded pool of reusable packet buffers.
pub struct BufferPool {
    tx: mpsc::Sender<Vec<u8>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(count: usize, size: usize) -> Self {
        let (tx, rx) = mpsc::channel(count);
        for _ in 0..count {
            // Capacity equals the preload count, so this cannot fail.
            let _ = tx.try_send(vec![0u8; size]);
        }
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Borrow a buffer, waiting until one is returned if all are out.
    pub async fn take(&self) -> Vec<u8> {
        let mut rx = self.rx.lock().await;
        // The pool holds its own sender, so the channel never closes.
        let buf = rx.recv().await.unwrap_or_default();
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        buf
    }

    /// Return a borrowed buffer.
    pub fn put(&self, buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
        let _ = self.tx.try_send(buf);
    }

    /// Buffers currently borrowed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

/// Per-session forwarding counters. Written by the copy loops, read by
/// anyone.
#[derive(Default)]
pub struct ForwardingStats {
    up_packets: AtomicU64,
    up_bytes: AtomicU64,
    down_packets: AtomicU64,
    down_bytes: AtomicU64,
    idle_warnings: AtomicU64,
}

impl ForwardingStats {
    fn record(&self, direction: Direction, bytes: usize) {
        let (packets, total) = match direction {
            Direction::Upstream => (&self.up_packets, &self.up_bytes),
            Direction::Downstream => (&self.down_packets, &self.down_bytes),
        };
        packets.fetch_add(1, Ordering::Relaxed);
        total.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            upstream_packets: self.up_packets.load(Ordering::Relaxed),
            upstream_bytes: self.up_bytes.load(Ordering::Relaxed),
            downstream_packets: self.down_packets.load(Ordering::Relaxed),
            downstream_bytes: self.down_bytes.load(Ordering::Relaxed),
            idle_warnings: self.idle_warnings.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the forwarding counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub upstream_packets: u64,
    pub upstream_bytes: u64,
    pub downstream_packets: u64,
    pub downstream_bytes: u64,
    pub idle_warnings: u64,
}

/// Read-only view of one copy loop, handed to the health monitor.
#[derive(Clone)]
pub struct LoopObserver {
    alive: watch::Receiver<bool>,
    death: Arc<Mutex<Option<Error>>>,
}

impl LoopObserver {
    pub fn is_alive(&self) -> bool {
        *self.alive.borrow()
    }

    /// Wait up to `dur` for the loop to die. Returns true when it died.
    pub async fn wait_dead(&mut self, dur: Duration) -> bool {
        if !self.is_alive() {
            return true;
        }
        tokio::time::timeout(dur, self.alive.wait_for(|alive| !alive))
            .await
            .is_ok()
    }

    /// Take the recorded death cause, if any. First failure wins; callers
    /// after the first get `None`.
    pub fn take_death_cause(&self) -> Option<Error> {
        self.death.lock().unwrap_or_else(|p| p.into_inner()).take()
    }
}

struct Shared {
    transport: Arc<dyn Transport>,
    device: Arc<dyn PacketDevice>,
    pool: BufferPool,
    stats: Arc<ForwardingStats>,
    config: ForwarderConfig,
    death: Arc<Mutex<Option<Error>>>,
    stop: watch::Sender<bool>,
    up_alive: watch::Sender<bool>,
    down_alive: watch::Sender<bool>,
}

impl Shared {
    /// Record the loop's exit, raise the stop flag, and force-close both
    /// endpoints so the other loop unblocks too.
    async fn loop_ended(&self, direction: Direction, result: Result<()>) {
        if let Err(e) = result {
            debug!(?direction, error = %e, "copy loop died");
            let mut death = self.death.lock().unwrap_or_else(|p| p.into_inner());
            if death.is_none() {
                *death = Some(e);
            }
        }
        let alive = match direction {
            Direction::Upstream => &self.up_alive,
            Direction::Downstream => &self.down_alive,
        };
        alive.send_replace(false);
        self.stop.send_replace(true);
        self.transport.close().await;
        self.device.close().await;
    }

    fn backoff(&self, zero_reads: u64) -> Duration {
        self.config
            .backoff_start
            .saturating_mul(zero_reads.min(u32::MAX as u64) as u32)
            .min(self.config.backoff_cap)
    }

    async fn upstream(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        let mut zero_reads: u64 = 0;
        loop {
            let mut buf = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
                buf = self.pool.take() => buf,
            };
            let read = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => {
                    self.pool.put(buf);
                    return Ok(());
                }
                read = self.device.read_packet(&mut buf) => read,
            };
            match read {
                Ok(0) => {
                    self.pool.put(buf);
                    zero_reads += 1;
                    if zero_reads == self.config.zero_read_warning {
                        warn!(zero_reads, "device delivers no packets");
                        self.stats.idle_warnings.fetch_add(1, Ordering::Relaxed);
                    }
                    tokio::select! {
                        _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
                        _ = tokio::time::sleep(self.backoff(zero_reads)) => {}
                    }
                }
                Ok(n) => {
                    zero_reads = 0;
                    let sent = self.transport.send(&buf[..n]).await;
                    self.pool.put(buf);
                    sent?;
                    self.stats.record(Direction::Upstream, n);
                }
                Err(e) => {
                    self.pool.put(buf);
                    return Err(e.into());
                }
            }
        }
    }

    async fn downstream(&self, mut stop: watch::Receiver<bool>) -> Result<()> {
        loop {
            let mut buf = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => return Ok(()),
                buf = self.pool.take() => buf,
            };
            let received = tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => {
                    self.pool.put(buf);
                    return Ok(());
                }
                received = self.transport.recv(&mut buf) => received,
            };
            match received {
                Ok(0) => self.pool.put(buf),
                Ok(n) => {
                    let written = self.device.write_packet(&buf[..n]).await;
                    self.pool.put(buf);
                    written?;
                    self.stats.record(Direction::Downstream, n);
                }
                Err(e) => {
                    self.pool.put(buf);
                    return Err(e);
                }
            }
        }
    }
}

/// Running pair of copy loops for one tunnel session.
pub struct PacketForwarder {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl PacketForwarder {
    /// Spawn both copy loops.
    pub fn start(
        transport: Arc<dyn Transport>,
        device: Arc<dyn PacketDevice>,
        config: ForwarderConfig,
    ) -> Self {
        let pool = BufferPool::new(config.pool_size, config.buffer_size);
        let (stop, _) = watch::channel(false);
        let (up_alive, _) = watch::channel(true);
        let (down_alive, _) = watch::channel(true);
        let shared = Arc::new(Shared {
            transport,
            device,
            pool,
            stats: Arc::new(ForwardingStats::default()),
            config,
            death: Arc::new(Mutex::new(None)),
            stop,
            up_alive,
            down_alive,
        });

        let tasks = vec![
            {
                let shared = shared.clone();
                let stop = shared.stop.subscribe();
                tokio::spawn(async move {
                    let result = shared.upstream(stop).await;
                    shared.loop_ended(Direction::Upstream, result).await;
                })
            },
            {
                let shared = shared.clone();
                let stop = shared.stop.subscribe();
                tokio::spawn(async move {
                    let result = shared.downstream(stop).await;
                    shared.loop_ended(Direction::Downstream, result).await;
                })
            },
        ];

        Self { shared, tasks }
    }

    /// Current forwarding counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Shared handle to the live counters, for the health monitor.
    pub fn stats_handle(&self) -> Arc<ForwardingStats> {
        self.shared.stats.clone()
    }

    /// Observer for one copy loop.
    pub fn observer(&self, direction: Direction) -> LoopObserver {
        let alive = match direction {
            Direction::Upstream => self.shared.up_alive.subscribe(),
            Direction::Downstream => self.shared.down_alive.subscribe(),
        };
        LoopObserver {
            alive,
            death: self.shared.death.clone(),
        }
    }

    /// Buffers currently borrowed from the pool.
    pub fn outstanding_buffers(&self) -> usize {
        self.shared.pool.outstanding()
    }

    /// Raise the stop flag, close both endpoints, and wait for both loops
    /// to finish. The flag covers devices whose reads keep returning "no
    /// data yet" after close.
    pub async fn stop(self) -> StatsSnapshot {
        self.shared.stop.send_replace(true);
        self.shared.transport.close().await;
        self.shared.device.close().await;
        for task in self.tasks {
            let _ = task.await;
        }
        self.shared.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::memory_pair;
    use crate::transport::ActivityClock;
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::Notify;

    /// Transport over in-process channels; `sent` echoes what was sent,
    /// `feed` injects inbound packets.
    struct ChannelTransport {
        sent: mpsc::Sender<Vec<u8>>,
        inbound: tokio::sync::Mutex<mpsc::Receiver<Vec<u8>>>,
        clock: ActivityClock,
        closed: AtomicBool,
        close_notify: Notify,
        recv_error: AtomicBool,
    }

    fn channel_transport() -> (Arc<ChannelTransport>, mpsc::Receiver<Vec<u8>>, mpsc::Sender<Vec<u8>>) {
        let (sent_tx, sent_rx) = mpsc::channel(64);
        let (feed_tx, feed_rx) = mpsc::channel(64);
        let transport = Arc::new(ChannelTransport {
            sent: sent_tx,
            inbound: tokio::sync::Mutex::new(feed_rx),
            clock: ActivityClock::new(),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            recv_error: AtomicBool::new(false),
        });
        (transport, sent_rx, feed_tx)
    }

    #[async_trait]
    impl Transport for ChannelTransport {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, payload: &[u8]) -> Result<usize> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::broken("closed"));
            }
            self.sent
                .send(payload.to_vec())
                .await
                .map_err(|_| Error::broken("closed"))?;
            self.clock.mark_sent();
            Ok(payload.len())
        }

        async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
            if self.recv_error.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "rst").into());
            }
            let mut inbound = self.inbound.lock().await;
            tokio::select! {
                _ = self.close_notify.notified() => {
                    Err(io::Error::new(io::ErrorKind::NotConnected, "closed").into())
                }
                packet = inbound.recv() => match packet {
                    Some(packet) => {
                        self.clock.mark_received();
                        let n = packet.len().min(buf.len());
                        buf[..n].copy_from_slice(&packet[..n]);
                        Ok(n)
                    }
                    None => {
                        if self.recv_error.load(Ordering::SeqCst) {
                            Err(io::Error::new(io::ErrorKind::ConnectionReset, "rst").into())
                        } else {
                            Err(io::Error::new(io::ErrorKind::NotConnected, "closed").into())
                        }
                    }
                },
            }
        }

        async fn beat(&self) -> Result<()> {
            Ok(())
        }

        fn valid_packet_received(&self) -> bool {
            self.clock.valid_packet_received()
        }

        fn last_sent_age(&self) -> Duration {
            self.clock.sent_age()
        }

        fn last_received_age(&self) -> Duration {
            self.clock.received_age()
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
            self.close_notify.notify_waiters();
        }
    }

    #[tokio::test]
    async fn test_forwards_both_directions() {
        let (device, app_side) = memory_pair();
        let (transport, mut sent_rx, feed_tx) = channel_transport();
        let forwarder = PacketForwarder::start(transport, device, ForwarderConfig::default());

        // Upstream: packet written into the device side shows up encapsulated.
        app_side.write_packet(b"up-packet").await.unwrap();
        assert_eq!(sent_rx.recv().await.unwrap(), b"up-packet");

        // Downstream: injected tunnel packet comes out of the device side.
        feed_tx.send(b"down-packet".to_vec()).await.unwrap();
        let mut buf = [0u8; 64];
        let n = app_side.read_packet(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"down-packet");

        let stats = forwarder.stop().await;
        assert_eq!(stats.upstream_packets, 1);
        assert_eq!(stats.upstream_bytes, 9);
        assert_eq!(stats.downstream_packets, 1);
        assert_eq!(stats.downstream_bytes, 11);
    }

    #[tokio::test]
    async fn test_buffers_returned_after_stop() {
        let (device, app_side) = memory_pair();
        let (transport, mut sent_rx, feed_tx) = channel_transport();
        let forwarder = PacketForwarder::start(
            transport,
            device,
            ForwarderConfig {
                pool_size: 2,
                ..ForwarderConfig::default()
            },
        );

        for i in 0..20u8 {
            app_side.write_packet(&[i; 8]).await.unwrap();
            assert_eq!(sent_rx.recv().await.unwrap(), [i; 8]);
            feed_tx.send(vec![i; 4]).await.unwrap();
            let mut buf = [0u8; 16];
            app_side.read_packet(&mut buf).await.unwrap();
        }

        let shared = forwarder.shared.clone();
        let stats = forwarder.stop().await;
        assert_eq!(stats.upstream_packets, 20);
        assert_eq!(shared.pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_idle_warning_fires_once() {
        /// Device that never has data.
        struct IdleDevice;
        #[async_trait]
        impl PacketDevice for IdleDevice {
            async fn read_packet(&self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            async fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
                Ok(packet.len())
            }
            async fn close(&self) {}
        }

        let (transport, _sent_rx, _feed_tx) = channel_transport();
        let forwarder = PacketForwarder::start(
            transport,
            Arc::new(IdleDevice),
            ForwarderConfig {
                backoff_start: Duration::from_micros(10),
                backoff_cap: Duration::from_micros(100),
                zero_read_warning: 5,
                ..ForwarderConfig::default()
            },
        );

        // Plenty of time for far more than 5 zero reads.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stats = forwarder.stop().await;
        assert_eq!(stats.idle_warnings, 1);
        assert_eq!(stats.upstream_packets, 0);
    }

    #[tokio::test]
    async fn test_stop_interrupts_device_with_no_data() {
        // A device that never delivers and does not react to close: only the
        // stop flag can get the upstream loop out of its backoff cycle.
        struct StubbornDevice;
        #[async_trait]
        impl PacketDevice for StubbornDevice {
            async fn read_packet(&self, _buf: &mut [u8]) -> io::Result<usize> {
                Ok(0)
            }
            async fn write_packet(&self, packet: &[u8]) -> io::Result<usize> {
                Ok(packet.len())
            }
            async fn close(&self) {}
        }

        let (transport, _sent_rx, _feed_tx) = channel_transport();
        let forwarder = PacketForwarder::start(
            transport,
            Arc::new(StubbornDevice),
            ForwarderConfig {
                backoff_start: Duration::from_secs(5),
                ..ForwarderConfig::default()
            },
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let stats = tokio::time::timeout(Duration::from_secs(2), forwarder.stop())
            .await
            .expect("stop must interrupt the idle read loop");
        assert_eq!(stats.upstream_packets, 0);
    }

    #[tokio::test]
    async fn test_inbound_death_recorded_and_stops_both() {
        let (device, _app_side) = memory_pair();
        let (transport, _sent_rx, feed_tx) = channel_transport();
        transport.recv_error.store(true, Ordering::SeqCst);
        drop(feed_tx);

        let forwarder =
            PacketForwarder::start(transport, device, ForwarderConfig::default());
        let mut down = forwarder.observer(Direction::Downstream);
        let mut up = forwarder.observer(Direction::Upstream);

        assert!(down.wait_dead(Duration::from_secs(1)).await);
        assert!(up.wait_dead(Duration::from_secs(1)).await);
        let cause = down.take_death_cause().unwrap();
        assert!(matches!(cause, Error::Io(_)));
        // First failure wins; a second taker sees nothing.
        assert!(up.take_death_cause().is_none());

        forwarder.stop().await;
    }
}
