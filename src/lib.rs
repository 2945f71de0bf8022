//! sixtun - resilient IPv6-over-IPv4 tunnel client.
//!
//! The client negotiates tunnel parameters with a TIC broker, establishes an
//! encapsulated transport (AYIYA-over-UDP or DTLS-over-UDP), and keeps that
//! transport alive across network transitions and transient broker failures.
//!
//! Core pieces, leaf to root:
//! - [`broker::BrokerClient`]: line-oriented TIC protocol client
//! - [`tunnel::TunnelCatalog`]: tunnel specifications plus active selection
//! - [`transport::Transport`]: AYIYA / DTLS encapsulation behind one contract
//! - [`forward::PacketForwarder`]: bidirectional packet copy loops
//! - [`monitor::HealthMonitor`]: heartbeat / stall-detection state machine
//! - [`orchestrator::Orchestrator`]: reconnect lifecycle

pub mod broker;
pub mod config;
pub mod device;
pub mod error;
pub mod forward;
pub mod monitor;
pub mod netinfo;
pub mod orchestrator;
pub mod status;
pub mod transport;
pub mod tunnel;

// Re-export main types
pub use config::Config;
pub use error::{Error, Result};
pub use orchestrator::Orchestrator;

// Client identification sent to the broker - the broker applies different
// handling based on the announced client.
pub const CLIENT_NAME: &str = "sixtun";
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const TIC_PROTOCOL: &str = "TIC/draft-00";

// Default configuration constants
pub const DEFAULT_CONFIG_FILE: &str = "config.json";
pub const DEFAULT_TIC_PORT: u16 = 3874;
pub const AYIYA_PORT: u16 = 5072;
pub const DTLS_PORT: u16 = 5073;
