//! Onion Core - Client Daemon Lifecycle
//!
//! Runs a local onion-routing client daemon for the browser: launches it,
//! authenticates over its control port, follows bootstrap progress, and
//! switches bridges and pluggable transports without restarting it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Host Process                         │
//! │                                                           │
//! │  ┌────────────┐   ┌───────────────────┐                   │
//! │  │ Delegate   │◀──│ ConnectionManager │◀── CapabilityProbe│
//! │  └────────────┘   └──┬──────┬──────┬──┘                   │
//! │                      │      │      │                      │
//! │          ┌───────────┘      │      └────────────┐         │
//! │          ▼                  ▼                   ▼         │
//! │  ┌──────────────┐  ┌────────────────┐  ┌───────────────┐  │
//! │  │ TorLauncher  │  │ TorControlPort │  │ Transport     │  │
//! │  │ (process)    │  │ (127.0.0.1)    │  │ Selector      │  │
//! │  └──────┬───────┘  └───────┬────────┘  └──┬─────────┬──┘  │
//! └─────────│──────────────────│──────────────│─────────│─────┘
//!           ▼                  ▼              ▼         ▼
//!     ┌───────────────────────────────┐   obfs4     snowflake
//!     │        client daemon          │   helper    helper
//!     └───────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Serialized control**: one task owns all state; start/stop/reconfigure
//!   never interleave
//! - **Live bridge switching**: ordered reset-then-apply over the control port
//! - **Stall detection**: a single retry timer per session
//! - **IPv6-only networks**: IP preferences follow the observed capability

mod bridges;
mod config;
mod control;
mod control_port;
mod daemon;
mod entry;
mod manager;
mod network;
mod retry;
mod transport;

#[cfg(test)]
mod testing;

pub use bridges::{BridgeSettings, BridgeStrategy, BridgeType, SNOWFLAKE_BRIDGE_LINE};
pub use config::{
    ConfigError, DaemonConfig, Obfs4Config, OnionConfig, SnowflakeConfig, TimingConfig,
    TransportsConfig,
};
pub use control::{Circuit, ControlChannel, ControlError, ControlEvent, ControlFactory, StatusEvent};
pub use control_port::{TorControlFactory, TorControlPort};
pub use daemon::{DaemonError, DaemonLauncher, DaemonProcess, TorLauncher, TorProcess};
pub use entry::{ConfigEntry, keys};
pub use manager::{
    Collaborators, ConnectionDelegate, ConnectionManager, ConnectionState, ManagerError,
};
pub use network::{CapabilityProbe, ManualProbe, NetworkCapability, RouteProbe, ip_entries};
pub use retry::RetryGuard;
pub use transport::{
    HelperError, ManagedTransport, PtMessage, TransportHelper, TransportSelector, parse_pt_line,
};
