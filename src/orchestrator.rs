//! Reconnect lifecycle.
//!
//! One orchestrator owns the whole client lifetime: it selects a tunnel,
//! builds a session (transport, interface, forwarder, monitor), waits for the
//! session to end, classifies the outcome, and decides whether to rebuild.
//! Transient failures rebuild, permanent ones end the run.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::broker::BrokerClient;
use crate::config::{BrokerSettings, Config};
use crate::device::{InterfaceConfig, InterfaceFactory};
use crate::error::Result;
use crate::forward::{Direction, ForwarderConfig, PacketForwarder};
use crate::monitor::{CatalogRefresher, EscalationGate, HealthMonitor, MonitorConfig, MonitorExit};
use crate::netinfo::{NetworkWatch, Reachability};
use crate::status::{ConnectionStatus, StatusReporter};
use crate::tunnel::{CatalogStore, Replacement, TunnelCatalog, TunnelSpec};

/// Minimum spacing between consecutive session attempts.
const RETRY_SPACING: Duration = Duration::from_secs(1);

/// How often a failed reachability probe is retried while parked. The
/// device may report the same network state throughout an outage, so the
/// probe cannot wait for a state change alone.
const PROBE_RETRY: Duration = Duration::from_secs(1);

/// Requests the orchestrator to wind down. Cheap to clone and safe to call
/// from any task; repeated calls are no-ops.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }
}

/// Broker-backed catalog refresh used by the health monitor.
struct BrokerRefresher {
    settings: BrokerSettings,
    catalog: Arc<Mutex<TunnelCatalog>>,
}

#[async_trait]
impl CatalogRefresher for BrokerRefresher {
    async fn refresh(&self) -> Result<Replacement> {
        let mut client = BrokerClient::connect(&self.settings).await?;
        let tunnels = client.suitable_tunnels().await;
        client.close().await;
        Ok(self.catalog.lock().await.replace(tunnels?))
    }
}

/// The client's control loop.
pub struct Orchestrator {
    config: Config,
    factory: Arc<dyn InterfaceFactory>,
    network: NetworkWatch,
    reachability: Arc<dyn Reachability>,
    store: Arc<dyn CatalogStore>,
    reporter: Arc<StatusReporter>,
    catalog: Arc<Mutex<TunnelCatalog>>,
    gate: Arc<EscalationGate>,
    stop_rx: watch::Receiver<bool>,
    stop_tx: Arc<watch::Sender<bool>>,
}

impl Orchestrator {
    /// Wire up an orchestrator. Returns the status stream for the UI
    /// boundary and the handle that requests shutdown.
    pub fn new(
        config: Config,
        factory: Arc<dyn InterfaceFactory>,
        network: NetworkWatch,
        reachability: Arc<dyn Reachability>,
        store: Arc<dyn CatalogStore>,
    ) -> (Self, watch::Receiver<ConnectionStatus>, StopHandle) {
        let (reporter, status_rx) = StatusReporter::new();
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let handle = StopHandle {
            tx: stop_tx.clone(),
        };
        (
            Self {
                config,
                factory,
                network,
                reachability,
                store,
                reporter: Arc::new(reporter),
                catalog: Arc::new(Mutex::new(TunnelCatalog::new())),
                gate: Arc::new(EscalationGate::default()),
                stop_rx,
                stop_tx,
            },
            status_rx,
            handle,
        )
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Run sessions until stopped or permanently failed.
    pub async fn run(mut self) -> Result<()> {
        if let Ok(Some(cached)) = self.store.load() {
            info!(tunnels = cached.len(), "loaded tunnel catalog from cache");
            *self.catalog.lock().await = cached;
        }

        let mut last_attempt: Option<Instant> = None;
        loop {
            if self.stop_requested() {
                self.reporter.idle(None);
                return Ok(());
            }
            if let Some(at) = last_attempt {
                let elapsed = at.elapsed();
                if elapsed < RETRY_SPACING {
                    // Small jitter keeps restarting clients from thundering
                    // at the broker in lockstep.
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..250));
                    tokio::time::sleep(RETRY_SPACING - elapsed + jitter).await;
                }
            }
            last_attempt = Some(Instant::now());

            match self.session().await {
                Ok(MonitorExit::Stopped) => {
                    self.reporter.idle(None);
                    return Ok(());
                }
                Ok(MonitorExit::CatalogChanged) => {
                    info!("tunnel catalog changed, reselecting");
                }
                Err(e) if e.is_interrupt() => {
                    self.reporter.idle(None);
                    return Ok(());
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "session failed, will retry");
                    self.reporter.disturbed(&e.to_string());
                    self.await_network().await;
                }
                Err(e) => {
                    warn!(error = %e, "giving up on permanent failure");
                    self.reporter.set_tunnel(None);
                    self.reporter.idle(Some(e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    /// Build and run one tunnel session to completion.
    async fn session(&mut self) -> Result<MonitorExit> {
        if !self.network.current().connected {
            self.await_network().await;
            if self.stop_requested() {
                return Ok(MonitorExit::Stopped);
            }
        }

        self.reporter.connecting(10, "selecting tunnel");
        let spec = self.select_tunnel().await?;
        self.reporter.set_tunnel(Some(spec.clone()));

        self.reporter.connecting(40, "establishing transport");
        let transport = crate::transport::create(&spec, &self.config)?;
        transport.connect().await?;

        self.reporter.connecting(70, "configuring interface");
        let routed = InterfaceConfig::routed(&spec);
        let unrouted = InterfaceConfig::unrouted(&spec);
        // Native routing is re-checked at establish time, not at selection.
        let network = self.network.current();
        let interface = if network.native_ipv6 && !self.config.tunnel.force_routed {
            unrouted
        } else {
            routed
        };
        let device = self.factory.establish(&interface).await?;

        let forwarder =
            PacketForwarder::start(transport.clone(), device.clone(), ForwarderConfig::default());
        self.reporter.connected(None);
        info!(tunnel = %spec.id, "tunnel session up");

        let refresher = Arc::new(BrokerRefresher {
            settings: self.config.broker.clone(),
            catalog: self.catalog.clone(),
        });
        let monitor = HealthMonitor::new(
            transport.clone(),
            forwarder.observer(Direction::Downstream),
            forwarder.stats_handle(),
            refresher,
            self.gate.clone(),
            self.network.clone(),
            self.reachability.clone(),
            self.reporter.clone(),
            MonitorConfig::for_tunnel(&spec, network.cellular),
        );
        let outcome = monitor.run(self.stop_rx.clone()).await;

        let stats = forwarder.stop().await;
        device.close().await;
        debug!(
            up = stats.upstream_packets,
            down = stats.downstream_packets,
            "session ended"
        );

        // A selection is only worth caching once it demonstrably works.
        if transport.valid_packet_received() {
            if let Err(e) = self.store.store(&*self.catalog.lock().await) {
                warn!(error = %e, "could not persist tunnel cache");
            }
        }
        outcome
    }

    /// Resolve the active tunnel, querying the broker when the catalog
    /// cannot answer on its own.
    async fn select_tunnel(&mut self) -> Result<TunnelSpec> {
        let preferred = self.config.tunnel.preferred.clone();
        {
            let mut catalog = self.catalog.lock().await;
            if let Ok(spec) = catalog.select_single(preferred.as_deref()) {
                return Ok(spec.clone());
            }
        }

        self.reporter.connecting(20, "querying tunnel broker");
        let mut client = BrokerClient::connect(&self.config.broker).await?;
        let tunnels = client.suitable_tunnels().await;
        client.close().await;

        let mut catalog = self.catalog.lock().await;
        catalog.replace(tunnels?);
        Ok(catalog.select_single(preferred.as_deref())?.clone())
    }

    /// Park until connectivity looks usable again, or stop is requested.
    async fn await_network(&mut self) {
        loop {
            if self.stop_requested() {
                return;
            }
            if self.network.current().connected && self.reachability.probe().await {
                return;
            }
            self.reporter.no_network();
            let mut stop = self.stop_rx.clone();
            tokio::select! {
                _ = stop.wait_for(|requested| *requested) => return,
                _ = self.network.changed() => {}
                _ = tokio::time::sleep(PROBE_RETRY) => {}
            }
        }
    }

    /// The stop sender, for embedders that hold the orchestrator itself.
    pub fn handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
        }
    }
}
