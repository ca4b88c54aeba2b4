//! Control Channel
//!
//! Authenticated request/response link to the running daemon. The
//! connection manager only talks to the daemon through this trait;
//! [`crate::control_port::TorControlPort`] is the TCP implementation.

use crate::entry::ConfigEntry;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::broadcast;

/// Status event category carrying bootstrap progress
pub const STATUS_CLIENT: &str = "STATUS_CLIENT";

/// Status event action carrying bootstrap progress
pub const BOOTSTRAP: &str = "BOOTSTRAP";

/// Asynchronous event delivered by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// Circuit readiness changed
    CircuitEstablished(bool),
    /// Status event (`650 STATUS_* <severity> <action> <args>`)
    Status(StatusEvent),
}

/// Parsed status event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// `STATUS_CLIENT`, `STATUS_GENERAL`, ...
    pub category: String,
    /// `NOTICE`, `WARN`, `ERR`
    pub severity: String,
    /// `BOOTSTRAP`, `CIRCUIT_ESTABLISHED`, ...
    pub action: String,
    /// Keyword arguments
    pub arguments: HashMap<String, String>,
}

impl StatusEvent {
    /// Is this a client bootstrap status event?
    pub fn is_bootstrap(&self) -> bool {
        self.category == STATUS_CLIENT && self.action == BOOTSTRAP
    }

    /// Bootstrap percentage, clamped to 100
    pub fn bootstrap_progress(&self) -> Option<u8> {
        if !self.is_bootstrap() {
            return None;
        }

        self.arguments
            .get("PROGRESS")
            .and_then(|p| p.parse::<u32>().ok())
            .map(|p| p.min(100) as u8)
    }
}

/// A circuit as reported by `GETINFO circuit-status`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Circuit {
    /// Circuit identifier
    pub id: String,
    /// `LAUNCHED`, `BUILT`, `EXTENDED`, `FAILED`, `CLOSED`, ...
    pub status: String,
    /// Relays as `$FINGERPRINT~nickname`
    pub path: Vec<String>,
    /// `PURPOSE` keyword, if present
    pub purpose: Option<String>,
}

impl Circuit {
    /// Is the circuit ready for traffic?
    pub fn is_built(&self) -> bool {
        self.status == "BUILT"
    }
}

/// Control channel errors
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Control port file unreadable: {0}")]
    PortFile(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Connection closed")]
    Closed,

    #[error("No reply within {0:?}")]
    Timeout(std::time::Duration),

    #[error("Command rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Request/response link to the daemon
///
/// All methods complete when the daemon answered; a rejected command is an
/// error. Events are delivered on a broadcast receiver after
/// [`ControlChannel::subscribe_events`].
#[async_trait]
pub trait ControlChannel: Send {
    /// Is the transport connected?
    fn is_connected(&self) -> bool;

    /// Open the connection
    async fn connect(&mut self) -> Result<(), ControlError>;

    /// Authenticate with the daemon's cookie
    async fn authenticate(&mut self, cookie: &[u8]) -> Result<(), ControlError>;

    /// Enable event delivery and return a receiver for it
    async fn subscribe_events(&mut self) -> Result<broadcast::Receiver<ControlEvent>, ControlError>;

    /// Set one option
    async fn set_conf(&mut self, entry: &ConfigEntry) -> Result<(), ControlError>;

    /// Set several options in one atomic command
    async fn set_confs(&mut self, entries: &[ConfigEntry]) -> Result<(), ControlError>;

    /// Reset an option to its default
    async fn reset_conf(&mut self, key: &str) -> Result<(), ControlError>;

    /// Make the daemon drop and re-establish its network attachment
    async fn reset_connection(&mut self) -> Result<(), ControlError>;

    /// Does the daemon currently have an established circuit?
    async fn circuit_established(&mut self) -> Result<bool, ControlError>;

    /// Current circuits
    async fn circuits(&mut self) -> Result<Vec<Circuit>, ControlError>;

    /// Close circuits by id
    async fn close_circuits(&mut self, ids: &[String]) -> Result<(), ControlError>;

    /// Close the connection
    async fn disconnect(&mut self);
}

/// Creates control channels for a daemon instance
pub trait ControlFactory: Send {
    /// New, unconnected channel for the daemon announcing itself in `port_file`
    fn create(&self, port_file: &Path) -> Box<dyn ControlChannel>;
}
