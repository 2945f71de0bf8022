//! Tunnel health monitoring.
//!
//! One monitor runs per session, next to the forwarder. It watches the
//! inbound copy loop and the transport's activity clock: silence for a full
//! heartbeat interval raises suspicion, two suspicious intervals in a row
//! escalate to a broker re-query, provided the tunnel description is older
//! than the re-check cooldown. The broker's answer decides between
//! reconnecting with a fresh catalog and declaring the tunnel dead.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::forward::{ForwardingStats, LoopObserver};
use crate::netinfo::{NetworkWatch, Reachability};
use crate::status::StatusReporter;
use crate::transport::Transport;
use crate::tunnel::{Replacement, TunnelSpec};

/// Heartbeat floor on cellular networks. Tunnel specs may ask for shorter
/// intervals; the radio cost is not worth it.
const CELLULAR_HEARTBEAT_FLOOR: Duration = Duration::from_secs(300);

/// Minimum spacing between broker re-queries.
const RECHECK_COOLDOWN: Duration = Duration::from_secs(3600);

/// How a monitor run ends when the session was not at fault.
#[derive(Debug, PartialEq, Eq)]
pub enum MonitorExit {
    /// Shutdown was requested.
    Stopped,
    /// The broker re-query produced a changed catalog; reconnect with it.
    CatalogChanged,
}

/// Re-query the broker and fold the answer into the catalog.
#[async_trait]
pub trait CatalogRefresher: Send + Sync {
    async fn refresh(&self) -> Result<Replacement>;
}

/// Rate limit shared by all monitor runs of one client lifetime.
pub struct EscalationGate {
    cooldown: Duration,
    last: Mutex<Option<Instant>>,
}

impl EscalationGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last: Mutex::new(None),
        }
    }

    fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether a re-query is allowed now; passing arms the cooldown.
    fn try_pass(&self) -> bool {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        match *last {
            Some(at) if at.elapsed() < self.cooldown => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }
}

impl Default for EscalationGate {
    fn default() -> Self {
        Self::new(RECHECK_COOLDOWN)
    }
}

/// Monitor timing.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Expected inbound activity interval, from the tunnel description.
    pub heartbeat: Duration,
    /// The native network is cellular.
    pub cellular: bool,
    /// Heartbeat floor applied on cellular networks.
    pub cellular_floor: Duration,
    /// Age of the tunnel description when the session started.
    pub tunnel_age: Duration,
}

impl MonitorConfig {
    pub fn for_tunnel(spec: &TunnelSpec, cellular: bool) -> Self {
        Self {
            heartbeat: spec.heartbeat(),
            cellular,
            cellular_floor: CELLULAR_HEARTBEAT_FLOOR,
            tunnel_age: spec.age(),
        }
    }

    /// Check interval: the tunnel's heartbeat, floored on cellular. The
    /// floor stretches the cycle, it never relaxes what counts as silence
    /// within one cycle.
    fn tick(&self) -> Duration {
        if self.cellular {
            self.heartbeat.max(self.cellular_floor)
        } else {
            self.heartbeat
        }
    }
}

/// Health monitor for one tunnel session.
pub struct HealthMonitor {
    transport: Arc<dyn Transport>,
    observer: LoopObserver,
    stats: Arc<ForwardingStats>,
    refresher: Arc<dyn CatalogRefresher>,
    gate: Arc<EscalationGate>,
    network: NetworkWatch,
    reachability: Arc<dyn Reachability>,
    reporter: Arc<StatusReporter>,
    config: MonitorConfig,
}

impl HealthMonitor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        observer: LoopObserver,
        stats: Arc<ForwardingStats>,
        refresher: Arc<dyn CatalogRefresher>,
        gate: Arc<EscalationGate>,
        network: NetworkWatch,
        reachability: Arc<dyn Reachability>,
        reporter: Arc<StatusReporter>,
        config: MonitorConfig,
    ) -> Self {
        Self {
            transport,
            observer,
            stats,
            refresher,
            gate,
            network,
            reachability,
            reporter,
            config,
        }
    }

    /// Run until the session ends.
    ///
    /// `Ok` means the session should end without blaming the tunnel;
    /// `Err` carries the failure the orchestrator classifies.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<MonitorExit> {
        let tick = self.config.tick();
        let started = Instant::now();
        let mut suspicious_ticks: u32 = 0;
        debug!(tick_secs = tick.as_secs(), "health monitor started");

        loop {
            let died = tokio::select! {
                _ = shutdown.wait_for(|requested| *requested) => {
                    return Ok(MonitorExit::Stopped);
                }
                died = self.observer.wait_dead(tick) => died,
            };

            if died {
                let cause = self
                    .observer
                    .take_death_cause()
                    .unwrap_or_else(|| Error::broken("copy loop ended"));
                return Err(cause);
            }

            // Keep the NAT mapping warm even when nothing else is flowing.
            if self.transport.last_sent_age() >= tick {
                self.transport.beat().await?;
            }

            if self.transport.last_received_age() < tick {
                if suspicious_ticks > 0 {
                    info!("inbound traffic resumed");
                }
                suspicious_ticks = 0;
                self.reporter.connected(Some(self.stats.snapshot()));
                continue;
            }

            // Silence alone does not condemn the tunnel. A disconnected
            // device is not the tunnel's fault, and a successful direct
            // probe means the silence is plain idleness.
            if !self.network.current().connected {
                debug!("inbound silence while device is offline");
                suspicious_ticks = 0;
                self.reporter.no_network();
                continue;
            }
            if self.reachability.probe().await {
                debug!("inbound silence but probe target reachable");
                suspicious_ticks = 0;
                continue;
            }

            suspicious_ticks += 1;
            warn!(suspicious_ticks, "no inbound traffic for a full heartbeat interval");
            self.reporter.disturbed("no inbound traffic");

            if suspicious_ticks < 2 {
                continue;
            }
            // A description fetched within the cooldown was vetted recently
            // enough; condemning the session has to do without the broker.
            let tunnel_age = self.config.tunnel_age.saturating_add(started.elapsed());
            if tunnel_age < self.gate.cooldown() {
                debug!("tunnel description younger than the re-check cooldown");
                return Err(Error::broken("tunnel unresponsive"));
            }
            if !self.gate.try_pass() {
                debug!("broker re-query still in cooldown");
                return Err(Error::broken("tunnel unresponsive"));
            }
            info!("re-querying broker to verify tunnel");
            return match self.refresher.refresh().await? {
                Replacement::Changed => Ok(MonitorExit::CatalogChanged),
                Replacement::Preserved => Err(Error::TunnelDead),
            };
        }
    }
}
