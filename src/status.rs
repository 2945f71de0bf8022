//! Connection status reporting.
//!
//! The control loop publishes snapshots into a watch channel on every
//! meaningful transition. Publishing never blocks; observers that stop
//! listening simply miss intermediate snapshots.

use serde::Serialize;
use tokio::sync::watch;

use crate::forward::StatsSnapshot;
use crate::tunnel::TunnelSpec;

/// High-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TunnelState {
    /// No session and none being built.
    Idle,
    /// Session being established.
    Connecting,
    /// Packets are flowing.
    Connected,
    /// Session exists but health is in question.
    Disturbed,
    /// Waiting for the device to regain connectivity.
    NoNetwork,
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelState::Idle => write!(f, "Idle"),
            TunnelState::Connecting => write!(f, "Connecting"),
            TunnelState::Connected => write!(f, "Connected"),
            TunnelState::Disturbed => write!(f, "Disturbed"),
            TunnelState::NoNetwork => write!(f, "No Network"),
        }
    }
}

/// Snapshot of the connection state, mutated only by the control loop.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    /// Current state.
    pub state: TunnelState,
    /// Progress of the current transition, 0-100.
    pub progress: u8,
    /// Human-readable description of the current activity.
    pub activity: String,
    /// Failure cause, when one is known.
    pub cause: Option<String>,
    /// The tunnel this session runs on, once selected.
    pub tunnel: Option<TunnelSpec>,
    /// Forwarding statistics of the active session.
    pub stats: Option<StatsSnapshot>,
}

impl ConnectionStatus {
    fn idle() -> Self {
        Self {
            state: TunnelState::Idle,
            progress: 0,
            activity: "idle".to_string(),
            cause: None,
            tunnel: None,
            stats: None,
        }
    }
}

/// Publisher handle owned by the control loop.
pub struct StatusReporter {
    tx: watch::Sender<ConnectionStatus>,
    tunnel: std::sync::Mutex<Option<TunnelSpec>>,
}

impl StatusReporter {
    /// Create a reporter and the receiver handed to the UI boundary.
    pub fn new() -> (Self, watch::Receiver<ConnectionStatus>) {
        let (tx, rx) = watch::channel(ConnectionStatus::idle());
        (
            Self {
                tx,
                tunnel: std::sync::Mutex::new(None),
            },
            rx,
        )
    }

    /// Remember the active tunnel for subsequent snapshots.
    pub fn set_tunnel(&self, tunnel: Option<TunnelSpec>) {
        *self.tunnel.lock().unwrap_or_else(|p| p.into_inner()) = tunnel;
    }

    /// Publish a snapshot. Fire-and-forget.
    pub fn report(&self, state: TunnelState, progress: u8, activity: &str) {
        self.publish(state, progress, activity, None, None);
    }

    /// Publish a `Connecting` snapshot.
    pub fn connecting(&self, progress: u8, activity: &str) {
        self.publish(TunnelState::Connecting, progress, activity, None, None);
    }

    /// Publish a `Connected` snapshot.
    pub fn connected(&self, stats: Option<StatsSnapshot>) {
        self.publish(TunnelState::Connected, 100, "tunnel up", None, stats);
    }

    /// Publish a `Disturbed` snapshot with a cause.
    pub fn disturbed(&self, cause: &str) {
        self.publish(TunnelState::Disturbed, 100, "tunnel disturbed", Some(cause.to_string()), None);
    }

    /// Publish a `NoNetwork` snapshot.
    pub fn no_network(&self) {
        self.publish(TunnelState::NoNetwork, 0, "waiting for connectivity", None, None);
    }

    /// Publish an `Idle` snapshot, optionally carrying the final cause.
    pub fn idle(&self, cause: Option<String>) {
        self.publish(TunnelState::Idle, 0, "stopped", cause, None);
    }

    fn publish(
        &self,
        state: TunnelState,
        progress: u8,
        activity: &str,
        cause: Option<String>,
        stats: Option<StatsSnapshot>,
    ) {
        let tunnel = self
            .tunnel
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        // send_replace never blocks, with or without receivers.
        self.tx.send_replace(ConnectionStatus {
            state,
            progress,
            activity: activity.to_string(),
            cause,
            tunnel,
            stats,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshots_observed() {
        let (reporter, rx) = StatusReporter::new();
        assert_eq!(rx.borrow().state, TunnelState::Idle);

        reporter.connecting(20, "querying tunnel broker");
        assert_eq!(rx.borrow().state, TunnelState::Connecting);
        assert_eq!(rx.borrow().progress, 20);

        reporter.connected(None);
        assert_eq!(rx.borrow().state, TunnelState::Connected);

        reporter.disturbed("heartbeat failed");
        let snap = rx.borrow().clone();
        assert_eq!(snap.state, TunnelState::Disturbed);
        assert_eq!(snap.cause.as_deref(), Some("heartbeat failed"));
    }

    #[test]
    fn test_publish_without_receiver() {
        let (reporter, rx) = StatusReporter::new();
        drop(rx);
        // Must not block or panic with nobody listening.
        reporter.no_network();
        reporter.idle(None);
    }
}
