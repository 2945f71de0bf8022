//! AYIYA ("Anything In Anything") over UDP.
//!
//! Packet layout:
//! ```text
//! +--------+--------+--------+--------+----------------+
//! | id l/t | sig/hsh| aut/op | nexthd | epoch (4B BE)  |
//! +--------+--------+--------+--------+----------------+
//! | identity (16B, client IPv6)                        |
//! +----------------------------------------------------+
//! | signature (20B, SHA-1)                             |
//! +----------------------------------------------------+
//! | payload (encapsulated IPv6 packet)                 |
//! +----------------------------------------------------+
//! ```
//! The signature is SHA-1 over the whole packet with the signature slot
//! pre-filled with SHA-1 of the tunnel password. The receiver recomputes it
//! the same way and additionally rejects frames whose embedded epoch is
//! outside a small freshness window.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};
use ring::digest::{digest, SHA1_FOR_LEGACY_USE_ONLY};
use subtle::ConstantTimeEq;
use tokio::net::UdpSocket;
use tokio::sync::Notify;
use tracing::{debug, info, trace};

use crate::error::{Error, Result};
use crate::transport::{ActivityClock, Transport};
use crate::tunnel::TunnelSpec;
use crate::AYIYA_PORT;

/// Fixed header length.
const HEADER_LEN: usize = 8;
/// Identity field length (one IPv6 address).
const IDENTITY_LEN: usize = 16;
/// Signature field length (SHA-1 digest).
const SIGNATURE_LEN: usize = 20;
/// Minimum frame: header + identity + signature.
const MIN_FRAME_LEN: usize = HEADER_LEN + IDENTITY_LEN + SIGNATURE_LEN;

/// Identity length nibble: 2^4 = 16 bytes.
const ID_LEN_NIBBLE: u8 = 4;
/// Identity type: integer (an address).
const ID_TYPE_INTEGER: u8 = 1;
/// Signature length in 32-bit words: 5 * 4 = 20 bytes.
const SIG_LEN_WORDS: u8 = 5;
/// Hash method: SHA-1.
const HASH_SHA1: u8 = 1;
/// Authentication method: shared secret.
const AUTH_SHARED_SECRET: u8 = 1;

/// Opcodes.
const OP_NOOP: u8 = 0;
const OP_FORWARD: u8 = 1;
const OP_ECHO_RESPONSE: u8 = 4;

/// Next-header values.
const NEXT_HEADER_IPV6: u8 = 41;
const NEXT_HEADER_NONE: u8 = 59;

/// Freshness window for embedded epoch timestamps.
const MAX_EPOCH_SKEW: Duration = Duration::from_secs(120);

/// Largest inbound datagram we accept.
const RECV_BUF_LEN: usize = 2048;

fn epoch_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as u32
}

/// Build a signed frame.
fn build_frame(
    secret_hash: &[u8; SIGNATURE_LEN],
    identity: &[u8; IDENTITY_LEN],
    opcode: u8,
    next_header: u8,
    epoch: u32,
    payload: &[u8],
) -> BytesMut {
    let mut frame = BytesMut::with_capacity(MIN_FRAME_LEN + payload.len());
    frame.put_u8((ID_LEN_NIBBLE << 4) | ID_TYPE_INTEGER);
    frame.put_u8((SIG_LEN_WORDS << 4) | HASH_SHA1);
    frame.put_u8((AUTH_SHARED_SECRET << 4) | opcode);
    frame.put_u8(next_header);
    frame.put_u32(epoch);
    frame.put_slice(identity);
    frame.put_slice(secret_hash);
    frame.put_slice(payload);

    let signature = digest(&SHA1_FOR_LEGACY_USE_ONLY, &frame);
    frame[HEADER_LEN + IDENTITY_LEN..MIN_FRAME_LEN].copy_from_slice(signature.as_ref());
    frame
}

/// Verify a frame: structure, signature, epoch freshness.
///
/// Returns the opcode and payload on success.
fn verify_frame<'a>(
    secret_hash: &[u8; SIGNATURE_LEN],
    max_skew: Duration,
    raw: &'a [u8],
) -> Option<(u8, &'a [u8])> {
    if raw.len() < MIN_FRAME_LEN {
        trace!(len = raw.len(), "ayiya frame too short");
        return None;
    }
    if raw[0] != (ID_LEN_NIBBLE << 4) | ID_TYPE_INTEGER
        || raw[1] != (SIG_LEN_WORDS << 4) | HASH_SHA1
        || raw[2] >> 4 != AUTH_SHARED_SECRET
    {
        trace!("ayiya frame with unsupported header fields");
        return None;
    }

    let epoch = u32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]);
    let skew = (i64::from(epoch) - i64::from(epoch_now())).unsigned_abs();
    if skew > max_skew.as_secs() {
        debug!(skew, "rejecting ayiya frame with stale epoch");
        return None;
    }

    let mut check = BytesMut::from(raw);
    check[HEADER_LEN + IDENTITY_LEN..MIN_FRAME_LEN].copy_from_slice(secret_hash);
    let expected = digest(&SHA1_FOR_LEGACY_USE_ONLY, &check);
    let signature = &raw[HEADER_LEN + IDENTITY_LEN..MIN_FRAME_LEN];
    if !bool::from(expected.as_ref().ct_eq(signature)) {
        debug!("rejecting ayiya frame with bad signature");
        return None;
    }

    Some((raw[2] & 0x0f, &raw[MIN_FRAME_LEN..]))
}

/// AYIYA transport session.
pub struct AyiyaTransport {
    remote: SocketAddr,
    identity: [u8; IDENTITY_LEN],
    secret_hash: [u8; SIGNATURE_LEN],
    clock: ActivityClock,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl AyiyaTransport {
    /// Session towards the tunnel's PoP on the well-known AYIYA port.
    pub fn new(spec: &TunnelSpec) -> Self {
        Self::with_remote(spec, SocketAddr::new(spec.pop_v4.into(), AYIYA_PORT))
    }

    /// Session towards an explicit remote endpoint.
    pub fn with_remote(spec: &TunnelSpec, remote: SocketAddr) -> Self {
        let mut secret_hash = [0u8; SIGNATURE_LEN];
        secret_hash
            .copy_from_slice(digest(&SHA1_FOR_LEGACY_USE_ONLY, spec.password.as_bytes()).as_ref());
        Self {
            remote,
            identity: spec.client_v6.octets(),
            secret_hash,
            clock: ActivityClock::new(),
            socket: RwLock::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    fn socket_handle(&self) -> Result<Arc<UdpSocket>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::broken("transport closed"));
        }
        self.socket
            .read()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::broken("transport not connected"))
    }

    async fn send_frame(&self, opcode: u8, next_header: u8, payload: &[u8]) -> Result<usize> {
        let socket = self.socket_handle()?;
        let frame = build_frame(
            &self.secret_hash,
            &self.identity,
            opcode,
            next_header,
            epoch_now(),
            payload,
        );
        let sent = socket.send(&frame).await?;
        self.clock.mark_sent();
        Ok(sent.saturating_sub(MIN_FRAME_LEN))
    }
}

#[async_trait::async_trait]
impl Transport for AyiyaTransport {
    async fn connect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::broken("transport closed"));
        }
        let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
        socket.connect(self.remote).await?;
        info!(remote = %self.remote, "ayiya transport connected");
        *self.socket.write().unwrap() = Some(Arc::new(socket));

        // Announce ourselves so the PoP learns our NAT mapping right away.
        self.send_frame(OP_NOOP, NEXT_HEADER_NONE, &[]).await?;
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<usize> {
        self.send_frame(OP_FORWARD, NEXT_HEADER_IPV6, payload).await?;
        Ok(payload.len())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let socket = self.socket_handle()?;
        let mut raw = [0u8; RECV_BUF_LEN];
        loop {
            let len = tokio::select! {
                _ = self.close_notify.notified() => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        "transport closed",
                    )
                    .into());
                }
                received = socket.recv(&mut raw) => received?,
            };

            match verify_frame(&self.secret_hash, MAX_EPOCH_SKEW, &raw[..len]) {
                Some((OP_FORWARD, payload)) if !payload.is_empty() => {
                    self.clock.mark_received();
                    let n = payload.len().min(buf.len());
                    buf[..n].copy_from_slice(&payload[..n]);
                    return Ok(n);
                }
                Some((OP_NOOP | OP_ECHO_RESPONSE, _)) => {
                    // Heartbeat from the PoP: proves the tunnel is alive but
                    // carries nothing to forward.
                    trace!("ayiya heartbeat received");
                    self.clock.mark_received();
                }
                Some((opcode, _)) => trace!(opcode, "ignoring ayiya frame"),
                None => {}
            }
        }
    }

    async fn beat(&self) -> Result<()> {
        self.send_frame(OP_NOOP, NEXT_HEADER_NONE, &[])
            .await
            .map_err(|e| Error::broken(format!("heartbeat send failed: {e}")))?;
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
        self.socket.write().unwrap().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv6Addr;

    fn spec(password: &str) -> TunnelSpec {
        let mut builder = crate::tunnel::TunnelSpecBuilder::new();
        for line in [
            "TunnelId: T1",
            "Type: ayiya",
            "IPv6 Endpoint: 2001:db8::2",
            "IPv6 PoP: 2001:db8::1",
            "IPv4 PoP: 127.0.0.1",
            "Enabled: true",
            "Valid: true",
            "Heartbeat_Interval: 60",
        ] {
            builder.apply_line(line);
        }
        builder.apply_line(&format!("Password: {password}"));
        builder.build().unwrap()
    }

    fn secret_hash(password: &str) -> [u8; SIGNATURE_LEN] {
        let mut hash = [0u8; SIGNATURE_LEN];
        hash.copy_from_slice(digest(&SHA1_FOR_LEGACY_USE_ONLY, password.as_bytes()).as_ref());
        hash
    }

    #[test]
    fn test_frame_round_trip() {
        let hash = secret_hash("ayiya-pass");
        let identity = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 2).octets();
        let frame = build_frame(&hash, &identity, OP_FORWARD, NEXT_HEADER_IPV6, epoch_now(), b"payload");

        let (opcode, payload) = verify_frame(&hash, MAX_EPOCH_SKEW, &frame).unwrap();
        assert_eq!(opcode, OP_FORWARD);
        assert_eq!(payload, b"payload");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let identity = [0u8; IDENTITY_LEN];
        let frame = build_frame(
            &secret_hash("right"),
            &identity,
            OP_FORWARD,
            NEXT_HEADER_IPV6,
            epoch_now(),
            b"data",
        );
        assert!(verify_frame(&secret_hash("wrong"), MAX_EPOCH_SKEW, &frame).is_none());
    }

    #[test]
    fn test_stale_epoch_rejected() {
        let hash = secret_hash("p");
        let identity = [0u8; IDENTITY_LEN];
        let stale = epoch_now() - 3600;
        let frame = build_frame(&hash, &identity, OP_FORWARD, NEXT_HEADER_IPV6, stale, b"data");
        // The signature itself is fine; freshness alone must reject it.
        assert!(verify_frame(&hash, MAX_EPOCH_SKEW, &frame).is_none());
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let hash = secret_hash("p");
        assert!(verify_frame(&hash, MAX_EPOCH_SKEW, &[0u8; 10]).is_none());
    }

    #[tokio::test]
    async fn test_send_and_recv_over_loopback() {
        // Peer socket plays the PoP.
        let pop = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let pop_addr = pop.local_addr().unwrap();

        let spec = spec("ayiya-pass");
        let transport = AyiyaTransport::with_remote(&spec, pop_addr);
        transport.connect().await.unwrap();

        // connect() sends an initial noop announcing the client address.
        let mut raw = [0u8; RECV_BUF_LEN];
        let (len, client_addr) = pop.recv_from(&mut raw).await.unwrap();
        let hash = secret_hash("ayiya-pass");
        let (opcode, _) = verify_frame(&hash, MAX_EPOCH_SKEW, &raw[..len]).unwrap();
        assert_eq!(opcode, OP_NOOP);

        // Outbound data is framed and signed.
        transport.send(b"ipv6-packet").await.unwrap();
        let (len, _) = pop.recv_from(&mut raw).await.unwrap();
        let (opcode, payload) = verify_frame(&hash, MAX_EPOCH_SKEW, &raw[..len]).unwrap();
        assert_eq!(opcode, OP_FORWARD);
        assert_eq!(payload, b"ipv6-packet");

        // Inbound: forged frames are dropped silently, valid ones returned.
        assert!(!transport.valid_packet_received());
        let bogus = build_frame(
            &secret_hash("not-the-secret"),
            &[0u8; IDENTITY_LEN],
            OP_FORWARD,
            NEXT_HEADER_IPV6,
            epoch_now(),
            b"evil",
        );
        pop.send_to(&bogus, client_addr).await.unwrap();
        let genuine = build_frame(
            &hash,
            &[0u8; IDENTITY_LEN],
            OP_FORWARD,
            NEXT_HEADER_IPV6,
            epoch_now(),
            b"reply",
        );
        pop.send_to(&genuine, client_addr).await.unwrap();

        let mut buf = [0u8; RECV_BUF_LEN];
        let n = transport.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"reply");
        assert!(transport.valid_packet_received());

        transport.close().await;
    }

    #[tokio::test]
    async fn test_beat_sends_noop() {
        let pop = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let spec = spec("p");
        let transport = AyiyaTransport::with_remote(&spec, pop.local_addr().unwrap());
        transport.connect().await.unwrap();
        transport.beat().await.unwrap();

        let mut raw = [0u8; RECV_BUF_LEN];
        // Skip the connect-time noop, then check the beat.
        pop.recv_from(&mut raw).await.unwrap();
        let (len, _) = pop.recv_from(&mut raw).await.unwrap();
        let (opcode, payload) = verify_frame(&secret_hash("p"), MAX_EPOCH_SKEW, &raw[..len]).unwrap();
        assert_eq!(opcode, OP_NOOP);
        assert!(payload.is_empty());
    }

    #[tokio::test]
    async fn test_close_unblocks_recv_and_beat_fails() {
        let pop = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let spec = spec("p");
        let transport = Arc::new(AyiyaTransport::with_remote(&spec, pop.local_addr().unwrap()));
        transport.connect().await.unwrap();

        let receiver = {
            let transport = transport.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; RECV_BUF_LEN];
                transport.recv(&mut buf).await
            })
        };
        tokio::task::yield_now().await;

        transport.close().await;
        assert!(receiver.await.unwrap().is_err());
        assert!(matches!(transport.beat().await, Err(Error::TunnelBroken(_))));
        // close is idempotent
        transport.close().await;
    }
}
