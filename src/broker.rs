//! TIC tunnel broker client.
//!
//! The broker speaks a plaintext line protocol: response lines begin with a
//! 3-digit status code, requests are single `<verb> <args>` lines, and
//! multi-line responses terminate with a status-coded line. A response whose
//! status does not begin with "2" is a permanent protocol rejection; socket
//! failures are transient and may be retried by the caller.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::BrokerSettings;
use crate::error::{Error, Result};
use crate::tunnel::TunnelSpec;
use crate::tunnel::TunnelSpecBuilder;
use crate::{CLIENT_NAME, CLIENT_VERSION, TIC_PROTOCOL};

/// Largest tolerated difference between local and broker clocks. AYIYA
/// signatures embed epoch timestamps, so a badly skewed clock can never
/// produce acceptable packets.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(120);

/// One parsed status line.
#[derive(Debug, Clone)]
struct StatusLine {
    code: u16,
    text: String,
}

impl StatusLine {
    fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }
}

/// Authenticated session with a TIC broker.
pub struct BrokerClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    timeout: Duration,
}

impl BrokerClient {
    /// Open a session and run the full handshake: welcome, client
    /// identification, clock skew check, and challenge/response login.
    pub async fn connect(settings: &BrokerSettings) -> Result<Self> {
        let addr = (settings.host.as_str(), settings.port);
        let stream = timeout(settings.timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| Error::Timeout)??;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();

        let mut client = Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout: settings.timeout(),
        };

        // Welcome banner must already be a success line.
        let welcome = client.read_status().await?;
        if !welcome.is_success() {
            return Err(Error::rejected(welcome.code, welcome.text));
        }
        debug!(broker = %settings.host, banner = %welcome.text, "broker welcome");

        client
            .request(&format!(
                "client {TIC_PROTOCOL} {CLIENT_NAME}/{CLIENT_VERSION} {}/unknown",
                std::env::consts::OS
            ))
            .await?;

        client.check_clock_skew().await?;
        client.login(&settings.username, &settings.password).await?;

        info!(broker = %settings.host, user = %settings.username, "broker session established");
        Ok(client)
    }

    /// List tunnel identifiers available to this account.
    pub async fn list_tunnels(&mut self) -> Result<Vec<String>> {
        let records = self.request_multi("tunnel list").await?;
        Ok(records
            .iter()
            .filter_map(|r| r.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    /// Fetch and parse one tunnel description.
    pub async fn describe_tunnel(&mut self, id: &str) -> Result<TunnelSpec> {
        let records = self.request_multi(&format!("tunnel show {id}")).await?;
        let mut builder = TunnelSpecBuilder::new();
        for line in &records {
            builder.apply_line(line);
        }
        builder.build()
    }

    /// Fetch all tunnels that are valid, enabled, and of a supported type.
    pub async fn suitable_tunnels(&mut self) -> Result<Vec<TunnelSpec>> {
        let ids = self.list_tunnels().await?;
        let mut tunnels = Vec::with_capacity(ids.len());
        for id in ids {
            match self.describe_tunnel(&id).await {
                Ok(spec) if spec.is_suitable() => tunnels.push(spec),
                Ok(spec) => debug!(id = %spec.id, "skipping unsuitable tunnel"),
                Err(Error::UnsupportedTunnelType(kind)) => {
                    debug!(id, kind, "skipping tunnel of unsupported type");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(tunnels)
    }

    /// Polite logout. Always safe to call; errors are swallowed.
    pub async fn close(mut self) {
        let _ = timeout(self.timeout, async {
            let _ = self.writer.write_all(b"QUIT bye\r\n").await;
            let _ = self.writer.flush().await;
        })
        .await;
    }

    /// Send one request and require a single success status line.
    async fn request(&mut self, line: &str) -> Result<StatusLine> {
        self.send_line(line).await?;
        let status = self.read_status().await?;
        if !status.is_success() {
            return Err(Error::rejected(status.code, status.text));
        }
        Ok(status)
    }

    /// Send one request and collect records until the terminal status line.
    ///
    /// The opening status line (e.g. "201 Showing ...") and the terminal one
    /// (e.g. "202 Done") must both be successes.
    async fn request_multi(&mut self, line: &str) -> Result<Vec<String>> {
        let opening = self.request(line).await?;
        debug!(request = line, opening = %opening.text, "reading multi-line response");

        let mut records = Vec::new();
        loop {
            let record = self.read_line().await?;
            if let Some(status) = parse_status(&record) {
                if !status.is_success() {
                    return Err(Error::rejected(status.code, status.text));
                }
                return Ok(records);
            }
            records.push(record);
        }
    }

    /// Compare broker and local clocks; fail permanently beyond the window.
    async fn check_clock_skew(&mut self) -> Result<()> {
        let status = self.request("get unixtime").await?;
        let broker_time: i64 = status
            .text
            .split_whitespace()
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(|| Error::Unexpected(format!("bad unixtime response: {}", status.text)))?;
        let local_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        let offset_secs = broker_time - local_time;
        if offset_secs.unsigned_abs() > MAX_CLOCK_SKEW.as_secs() {
            warn!(offset_secs, "local clock too far from broker clock");
            return Err(Error::ClockSkew { offset_secs });
        }
        debug!(offset_secs, "clock skew within bounds");
        Ok(())
    }

    /// Challenge/response login. Rejection here is an authentication failure,
    /// never retried silently.
    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.request(&format!("username {username}")).await?;

        let status = self.request("challenge md5").await?;
        let challenge = status
            .text
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::Unexpected("empty md5 challenge".into()))?
            .to_string();

        let response = auth_response(&challenge, password);
        self.send_line(&format!("authenticate md5 {response}")).await?;
        let status = self.read_status().await?;
        if !status.is_success() {
            return Err(Error::AuthenticationFailed(status.text));
        }
        Ok(())
    }

    async fn send_line(&mut self, line: &str) -> Result<()> {
        let framed = format!("{line}\r\n");
        timeout(self.timeout, async {
            self.writer.write_all(framed.as_bytes()).await?;
            self.writer.flush().await
        })
        .await
        .map_err(|_| Error::Timeout)??;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = timeout(self.timeout, self.reader.read_line(&mut line))
            .await
            .map_err(|_| Error::Timeout)??;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "broker closed connection",
            )
            .into());
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }

    async fn read_status(&mut self) -> Result<StatusLine> {
        let line = self.read_line().await?;
        parse_status(&line)
            .ok_or_else(|| Error::Unexpected(format!("expected status line, got: {line}")))
    }
}

/// Parse a "NNN text" status line; `None` for record lines.
fn parse_status(line: &str) -> Option<StatusLine> {
    let code = line.get(..3)?.parse::<u16>().ok()?;
    match line.as_bytes().get(3) {
        None => Some(StatusLine {
            code,
            text: String::new(),
        }),
        Some(b' ') => Some(StatusLine {
            code,
            text: line[4..].to_string(),
        }),
        Some(_) => None,
    }
}

/// The broker's documented md5 scheme:
/// `hex(MD5(challenge || hex(MD5(password))))`.
pub fn auth_response(challenge: &str, password: &str) -> String {
    let inner = format!("{:x}", md5::compute(password.as_bytes()));
    format!("{:x}", md5::compute(format!("{challenge}{inner}").as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn settings(addr: SocketAddr) -> BrokerSettings {
        BrokerSettings {
            host: addr.ip().to_string(),
            port: addr.port(),
            username: "XYZ1-TIC".to_string(),
            password: "s3cr3t".to_string(),
            timeout_secs: 5,
        }
    }

    fn unixtime_now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
    }

    /// Spawn a scripted broker: writes the welcome, then answers each
    /// request line through the responder closure.
    async fn spawn_broker<F>(welcome: &'static str, responder: F) -> SocketAddr
    where
        F: Fn(&str) -> Vec<String> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut write_half) = stream.into_split();
            write_half
                .write_all(format!("{welcome}\r\n").as_bytes())
                .await
                .unwrap();
            let mut reader = BufReader::new(read_half);
            let mut line = String::new();
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    break;
                }
                let request = line.trim_end();
                if request.starts_with("QUIT") {
                    break;
                }
                for reply in responder(request) {
                    write_half
                        .write_all(format!("{reply}\r\n").as_bytes())
                        .await
                        .unwrap();
                }
            }
        });
        addr
    }

    fn handshake_reply(request: &str) -> Option<Vec<String>> {
        if request.starts_with("client ") {
            Some(vec!["220 client ok".into()])
        } else if request == "get unixtime" {
            Some(vec![format!("200 {}", unixtime_now() + 1)])
        } else if request.starts_with("username ") {
            Some(vec!["230 ok".into()])
        } else if request == "challenge md5" {
            Some(vec!["200 abc123".into()])
        } else if request.starts_with("authenticate md5 ") {
            let expected = format!("authenticate md5 {}", auth_response("abc123", "s3cr3t"));
            if request == expected {
                Some(vec!["250 ok".into()])
            } else {
                Some(vec!["400 authentication failed".into()])
            }
        } else {
            None
        }
    }

    #[test]
    fn test_auth_response_vector() {
        // hex(MD5("abc123" || hex(MD5("s3cr3t"))))
        assert_eq!(
            auth_response("abc123", "s3cr3t"),
            "03b1577e19260d1b7e77daeff94b41b4"
        );
    }

    #[test]
    fn test_parse_status() {
        let status = parse_status("202 done").unwrap();
        assert_eq!(status.code, 202);
        assert_eq!(status.text, "done");
        assert!(status.is_success());
        assert!(parse_status("TunnelId: T1").is_none());
        assert!(parse_status("T19342 2001:db8::2 user").is_none());
        assert!(!parse_status("400 nope").unwrap().is_success());
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let addr = spawn_broker("200 welcome", |req| {
            handshake_reply(req).expect("unexpected request")
        })
        .await;
        let client = BrokerClient::connect(&settings(addr)).await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn test_connect_rejected_welcome() {
        let addr = spawn_broker("500 maintenance", |_| vec![]).await;
        let err = BrokerClient::connect(&settings(addr)).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::ProtocolRejected { code: 500, .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_connect_clock_skew() {
        let addr = spawn_broker("200 welcome", |req| {
            if req == "get unixtime" {
                vec![format!("200 {}", unixtime_now() + 500)]
            } else {
                handshake_reply(req).expect("unexpected request")
            }
        })
        .await;
        let err = BrokerClient::connect(&settings(addr)).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::ClockSkew { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_connect_bad_password() {
        let addr = spawn_broker("200 welcome", |req| {
            handshake_reply(req).expect("unexpected request")
        })
        .await;
        let mut bad = settings(addr);
        bad.password = "wrong".to_string();
        let err = BrokerClient::connect(&bad).await.map(|_| ()).unwrap_err();
        assert!(matches!(err, Error::AuthenticationFailed(_)));
    }

    #[tokio::test]
    async fn test_list_and_describe() {
        let addr = spawn_broker("200 welcome", |req| {
            if let Some(reply) = handshake_reply(req) {
                return reply;
            }
            match req {
                "tunnel list" => vec![
                    "201 listing".into(),
                    "T1 2001:db8::2 XYZ1-TIC".into(),
                    "T2 2001:db8::6 XYZ1-TIC".into(),
                    "202 done".into(),
                ],
                "tunnel show T1" => vec![
                    "201 showing".into(),
                    "TunnelId: T1".into(),
                    "Type: ayiya".into(),
                    "IPv6 Endpoint: 2001:db8::2".into(),
                    "IPv6 PoP: 2001:db8::1".into(),
                    "IPv4 PoP: 192.0.2.1".into(),
                    "Tunnel MTU: 1428".into(),
                    "Enabled: true".into(),
                    "Valid: true".into(),
                    "Heartbeat_Interval: 60".into(),
                    "202 done".into(),
                ],
                "tunnel show T2" => vec![
                    "201 showing".into(),
                    "TunnelId: T2".into(),
                    "Type: l2tp".into(),
                    "202 done".into(),
                ],
                other => panic!("unexpected request: {other}"),
            }
        })
        .await;

        let mut client = BrokerClient::connect(&settings(addr)).await.unwrap();
        let ids = client.list_tunnels().await.unwrap();
        assert_eq!(ids, vec!["T1", "T2"]);

        let spec = client.describe_tunnel("T1").await.unwrap();
        assert_eq!(spec.id, "T1");
        assert_eq!(spec.kind, crate::tunnel::TunnelKind::Ayiya);
        assert!(spec.enabled && spec.valid);
        assert!(spec.is_suitable());

        // T2 has an unsupported type and is filtered, not fatal.
        let suitable = client.suitable_tunnels().await.unwrap();
        assert_eq!(suitable.len(), 1);
        assert_eq!(suitable[0].id, "T1");
        client.close().await;
    }
}
