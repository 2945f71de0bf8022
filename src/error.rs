//! Error types for the tunnel client.
//!
//! The orchestrator is the single place that decides "retry same tunnel",
//! "reselect tunnel" or "give up", so every failure carries an explicit
//! transient/permanent classification instead of a deep exception hierarchy.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tunnel client.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors (socket reset, address change, closed endpoint).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Operation timed out.
    #[error("Operation timed out")]
    Timeout,

    /// Broker rejected a request at the protocol level.
    #[error("Broker rejected request: {message} (status {code})")]
    ProtocolRejected { code: u16, message: String },

    /// Broker rejected our credentials.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Local and broker clocks differ by more than the allowed skew.
    #[error("Clock skew too large: local and broker differ by {offset_secs}s")]
    ClockSkew { offset_secs: i64 },

    /// The transport declared itself unable to send.
    #[error("Tunnel broken: {0}")]
    TunnelBroken(String),

    /// Confirmed dead tunnel: no inbound traffic and the broker still lists
    /// it unchanged.
    #[error("Tunnel does not receive data")]
    TunnelDead,

    /// No valid, enabled tunnel of a supported encapsulation type exists.
    #[error("No suitable tunnels available")]
    NoSuitableTunnel,

    /// More than one suitable tunnel and no prior selection to go by.
    #[error("Ambiguous selection: {0} suitable tunnels, explicit choice required")]
    AmbiguousTunnel(usize),

    /// Tunnel referenced by id is not a member of the catalog.
    #[error("Tunnel {0} is not in the catalog")]
    NotInCatalog(String),

    /// Tunnel description uses an encapsulation this client does not speak.
    #[error("Unsupported tunnel type: {0}")]
    UnsupportedTunnelType(String),

    /// Explicit stop request. Not a failure.
    #[error("Interrupted")]
    Interrupted,

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Virtual interface boundary failure.
    #[error("Interface error: {0}")]
    Device(String),

    /// DTLS layer failure (handshake, record protection).
    #[error("DTLS error: {0}")]
    Dtls(String),

    /// Unexpected runtime fault; fatal to the current session.
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl Error {
    /// Create a new configuration error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new device error.
    pub fn device<S: Into<String>>(msg: S) -> Self {
        Self::Device(msg.into())
    }

    /// Create a new broken-tunnel error.
    pub fn broken<S: Into<String>>(msg: S) -> Self {
        Self::TunnelBroken(msg.into())
    }

    /// Create a rejection error from a broker status line.
    pub fn rejected(code: u16, message: impl Into<String>) -> Self {
        Self::ProtocolRejected {
            code,
            message: message.into(),
        }
    }

    /// Whether the orchestrator may retry the same tunnel after this error.
    ///
    /// Permanent failures (broker rejection, bad credentials, confirmed dead
    /// tunnel) must not be retried without new input.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Timeout | Self::TunnelBroken(_) | Self::Dtls(_) | Self::Device(_)
        )
    }

    /// Whether this is the clean shutdown path rather than a failure.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, Self::Interrupted)
    }
}
